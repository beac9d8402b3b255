//! Transaction cost analysis.

use crate::models::Side;

/// Implementation shortfall of an execution against its arrival price.
///
/// Arrival is the close of the last bar at or before the intent's `ts`.
/// Positive shortfall means the execution cost money versus arrival for
/// either side; undefined baselines (arrival <= 0) report 0.
#[derive(Debug, Clone, Copy)]
pub struct Tca {
    pub arrival: f64,
    pub fills_wavg: f64,
    pub side: Side,
}

impl Tca {
    pub fn shortfall_bps(&self) -> f64 {
        if self.arrival <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Buy => (self.fills_wavg / self.arrival - 1.0) * 1e4,
            Side::Sell => (1.0 - self.fills_wavg / self.arrival) * 1e4,
        }
    }
}
