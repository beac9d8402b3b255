//! Order execution: the per-order state machine and the execd worker
//! loop that drives it from queue reservations and broker events.

pub mod state_machine;
pub mod worker;
