//! Per-order execution lifecycle.
//!
//! Transitions are monotone along NEW → ACK → PARTIAL → FILL with REJ
//! and CANCEL branches; terminal states absorb every further event.
//! An event arriving in a state that does not permit it is dropped and
//! logged once per order.

use crate::models::Side;
use chrono::{DateTime, Utc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Ack,
    Rej,
    Partial,
    Fill,
    Cancel,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::New => "NEW",
            OrderState::Ack => "ACK",
            OrderState::Rej => "REJ",
            OrderState::Partial => "PARTIAL",
            OrderState::Fill => "FILL",
            OrderState::Cancel => "CANCEL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Rej | OrderState::Fill | OrderState::Cancel)
    }
}

#[derive(Debug, Clone)]
pub struct ExecState {
    pub tag: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub remaining: f64,
    pub state: OrderState,
    pub created_ts: DateTime<Utc>,
    pub ack_ts: Option<DateTime<Utc>>,
    pub fill_qty: f64,
    /// Size-weighted mean of all accepted partial prices.
    pub avg_fill_px: f64,
    pub rej_reason: Option<String>,
    pub cancel_ts: Option<DateTime<Utc>>,
    violation_logged: bool,
}

impl ExecState {
    pub fn new(
        tag: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: f64,
        created_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            tag: tag.into(),
            symbol: symbol.into(),
            side,
            qty,
            remaining: qty,
            state: OrderState::New,
            created_ts,
            ack_ts: None,
            fill_qty: 0.0,
            avg_fill_px: 0.0,
            rej_reason: None,
            cancel_ts: None,
            violation_logged: false,
        }
    }

    fn drop_event(&mut self, event: &str) {
        if !self.violation_logged {
            warn!(
                tag = %self.tag,
                state = self.state.as_str(),
                event,
                "dropping event not permitted in state"
            );
            self.violation_logged = true;
        }
    }

    /// First ACK captures `ack_ts`; later ACKs are violations.
    pub fn on_ack(&mut self, ts: DateTime<Utc>) {
        match self.state {
            OrderState::New => {
                self.state = OrderState::Ack;
                self.ack_ts = Some(ts);
            }
            _ => self.drop_event("ack"),
        }
    }

    pub fn on_rej(&mut self, _ts: DateTime<Utc>, reason: &str) {
        match self.state {
            OrderState::New | OrderState::Ack => {
                self.state = OrderState::Rej;
                self.rej_reason = Some(reason.to_string());
            }
            _ => self.drop_event("rej"),
        }
    }

    /// Accept a fill slice; transitions to FILL iff remaining reaches 0.
    pub fn on_partial(&mut self, _ts: DateTime<Utc>, px: f64, qty: f64) {
        match self.state {
            OrderState::Ack | OrderState::Partial => {
                let prev_fill = self.fill_qty;
                self.fill_qty += qty;
                self.remaining = (self.qty - self.fill_qty).max(0.0);
                self.avg_fill_px =
                    (self.avg_fill_px * prev_fill + px * qty) / self.fill_qty.max(1e-9);
                self.state = if self.remaining == 0.0 {
                    OrderState::Fill
                } else {
                    OrderState::Partial
                };
            }
            _ => self.drop_event("partial"),
        }
    }

    /// Alias for `on_partial` that may complete the order.
    pub fn on_fill(&mut self, ts: DateTime<Utc>, px: f64, qty: f64) {
        self.on_partial(ts, px, qty);
    }

    pub fn on_cancel(&mut self, ts: DateTime<Utc>) {
        match self.state {
            OrderState::New | OrderState::Ack | OrderState::Partial => {
                self.state = OrderState::Cancel;
                self.cancel_ts = Some(ts);
            }
            _ => self.drop_event("cancel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn new_order(qty: f64) -> ExecState {
        ExecState::new("t1", "SPY", Side::Buy, qty, t0())
    }

    #[test]
    fn test_happy_path_partial_then_fill() {
        let mut s = new_order(2.0);
        s.on_ack(t0());
        assert_eq!(s.state, OrderState::Ack);
        assert_eq!(s.ack_ts, Some(t0()));

        s.on_partial(t0(), 500.0, 1.0);
        assert_eq!(s.state, OrderState::Partial);
        assert_eq!(s.remaining, 1.0);

        s.on_fill(t0(), 500.2, 1.0);
        assert_eq!(s.state, OrderState::Fill);
        assert_eq!(s.remaining, 0.0);
        assert!((s.avg_fill_px - 500.1).abs() < 1e-9);
    }

    #[test]
    fn test_invariant_fill_plus_remaining() {
        let mut s = new_order(5.0);
        s.on_ack(t0());
        for _ in 0..5 {
            s.on_partial(t0(), 100.0, 1.0);
            assert!((s.fill_qty + s.remaining - s.qty).abs() < 1e-9);
        }
        assert_eq!(s.state, OrderState::Fill);
    }

    #[test]
    fn test_avg_px_is_size_weighted() {
        let mut s = new_order(4.0);
        s.on_ack(t0());
        s.on_partial(t0(), 100.0, 3.0);
        s.on_partial(t0(), 104.0, 1.0);
        assert!((s.avg_fill_px - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_requires_ack() {
        let mut s = new_order(1.0);
        s.on_partial(t0(), 100.0, 1.0);
        assert_eq!(s.state, OrderState::New);
        assert_eq!(s.fill_qty, 0.0);
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut s = new_order(1.0);
        s.on_ack(t0());
        s.on_fill(t0(), 100.0, 1.0);
        assert_eq!(s.state, OrderState::Fill);

        s.on_cancel(t0());
        s.on_rej(t0(), "late");
        s.on_partial(t0(), 100.0, 1.0);
        assert_eq!(s.state, OrderState::Fill);
        assert_eq!(s.fill_qty, 1.0);
        assert!(s.rej_reason.is_none());
    }

    #[test]
    fn test_rej_from_new_and_ack_only() {
        let mut s = new_order(2.0);
        s.on_rej(t0(), "no route");
        assert_eq!(s.state, OrderState::Rej);
        assert_eq!(s.rej_reason.as_deref(), Some("no route"));

        let mut s = new_order(2.0);
        s.on_ack(t0());
        s.on_partial(t0(), 100.0, 1.0);
        s.on_rej(t0(), "late");
        assert_eq!(s.state, OrderState::Partial);
    }

    #[test]
    fn test_cancel_after_partial() {
        let mut s = new_order(2.0);
        s.on_ack(t0());
        s.on_partial(t0(), 100.0, 1.0);
        s.on_cancel(t0());
        assert_eq!(s.state, OrderState::Cancel);
        assert_eq!(s.fill_qty, 1.0);
        assert_eq!(s.remaining, 1.0);
        assert!(s.cancel_ts.is_some());
    }

    #[test]
    fn test_ack_ts_captured_once() {
        let mut s = new_order(1.0);
        s.on_ack(t0());
        let later = t0() + chrono::Duration::seconds(5);
        s.on_ack(later);
        assert_eq!(s.ack_ts, Some(t0()));
    }
}
