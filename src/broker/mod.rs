//! Broker order-placement port.
//!
//! The concrete venue clients (IBKR gateway, Alpaca) live behind this
//! port and are swappable; the execution worker only sees `place`,
//! `cancel`, and a per-order event stream. `place` resolves once the
//! order reaches its first acknowledged state; the worker bounds that
//! wait with its ack window and treats the timeout as a transient fault.

pub mod paper;

use crate::models::NewOrder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Venue-assigned identifier for a placed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerHandle(pub String);

/// Per-order lifecycle events after acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Partial {
        ts: DateTime<Utc>,
        px: f64,
        qty: f64,
    },
    Cancel {
        ts: DateTime<Utc>,
    },
    Reject {
        ts: DateTime<Utc>,
        reason: String,
    },
}

/// A successfully placed order: handle, ack time, and the event stream
/// the worker drains into the state machine.
pub struct Placement {
    pub handle: BrokerHandle,
    pub ack_ts: DateTime<Utc>,
    pub events: mpsc::Receiver<OrderEvent>,
}

/// Placement failures the worker must distinguish: transport faults are
/// retryable, venue rejections are terminal for the tag.
#[derive(Debug)]
pub enum BrokerError {
    Transport(String),
    Rejected(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Transport(m) => write!(f, "broker transport fault: {m}"),
            BrokerError::Rejected(m) => write!(f, "broker rejected order: {m}"),
        }
    }
}

impl std::error::Error for BrokerError {}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit an order; resolves at the first acknowledged state.
    async fn place(&self, order: &NewOrder) -> Result<Placement, BrokerError>;

    /// Actively cancel a previously placed order. The resulting
    /// `Cancel` (or `Partial`→`Cancel`) arrives on the event stream.
    async fn cancel(&self, handle: &BrokerHandle) -> Result<(), BrokerError>;
}
