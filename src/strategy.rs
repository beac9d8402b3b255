//! Baseline signal strategy.
//!
//! The strategy contract is a pure callable from one bar to zero or more
//! intents, carrying only a bounded rolling window of close prices. It
//! must not block or grow unboundedly; the engine owns everything else
//! (risk, tagging, queueing).

use crate::models::{Bar1s, NewOrder, Side, Tif};
use std::collections::VecDeque;

/// 1-second mean reversion: when the close deviates more than
/// `threshold_bps` from the rolling mean, fade the move with a single
/// unit at the close. Emits nothing until the window is full.
#[derive(Debug)]
pub struct MeanReversion1s {
    symbol: String,
    threshold_bps: f64,
    window: usize,
    closes: VecDeque<f64>,
}

impl MeanReversion1s {
    pub fn new(symbol: impl Into<String>, threshold_bps: f64, window: usize) -> Self {
        Self {
            symbol: symbol.into(),
            threshold_bps,
            window,
            closes: VecDeque::with_capacity(window),
        }
    }

    /// Hot-set from runtime params before each decision.
    pub fn set_threshold_bps(&mut self, threshold_bps: f64) {
        self.threshold_bps = threshold_bps;
    }

    pub fn threshold_bps(&self) -> f64 {
        self.threshold_bps
    }

    pub fn on_bar(&mut self, bar: &Bar1s) -> Vec<NewOrder> {
        debug_assert_eq!(bar.symbol, self.symbol);
        if self.closes.len() == self.window {
            self.closes.pop_front();
        }
        self.closes.push_back(bar.close);
        if self.closes.len() < self.window {
            return Vec::new();
        }

        let mean: f64 = self.closes.iter().sum::<f64>() / self.closes.len() as f64;
        let dev_bps = (bar.close / mean - 1.0) * 1e4;

        let side = if dev_bps > self.threshold_bps {
            Side::Sell
        } else if dev_bps < -self.threshold_bps {
            Side::Buy
        } else {
            return Vec::new();
        };

        vec![NewOrder {
            symbol: self.symbol.clone(),
            side,
            qty: 1.0,
            tif: Tif::Day,
            limit: Some(bar.close),
            tag: None,
            ts: bar.ts,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn bar(sec: i64, close: f64) -> Bar1s {
        let ts: DateTime<Utc> =
            Utc.with_ymd_and_hms(2025, 1, 2, 14, 30, 0).unwrap() + Duration::seconds(sec);
        Bar1s {
            ts,
            symbol: "SPY".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
        }
    }

    #[test]
    fn test_silent_until_window_full() {
        let mut s = MeanReversion1s::new("SPY", 0.5, 5);
        for i in 0..4 {
            assert!(s.on_bar(&bar(i, 500.0)).is_empty());
        }
    }

    #[test]
    fn test_fades_upward_deviation() {
        let mut s = MeanReversion1s::new("SPY", 0.5, 5);
        for i in 0..4 {
            s.on_bar(&bar(i, 500.0));
        }
        // Mean ~500.04 after the spike; 500.2 is ~3.2bps above.
        let intents = s.on_bar(&bar(4, 500.2));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Sell);
        assert_eq!(intents[0].limit, Some(500.2));
        assert_eq!(intents[0].qty, 1.0);
    }

    #[test]
    fn test_fades_downward_deviation() {
        let mut s = MeanReversion1s::new("SPY", 0.5, 5);
        for i in 0..4 {
            s.on_bar(&bar(i, 500.0));
        }
        let intents = s.on_bar(&bar(4, 499.8));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Buy);
    }

    #[test]
    fn test_quiet_inside_threshold() {
        let mut s = MeanReversion1s::new("SPY", 50.0, 5);
        for i in 0..10 {
            assert!(s.on_bar(&bar(i, 500.0 + (i % 3) as f64 * 0.01)).is_empty());
        }
    }

    #[test]
    fn test_window_stays_bounded() {
        let mut s = MeanReversion1s::new("SPY", 1e9, 30);
        for i in 0..1000 {
            s.on_bar(&bar(i, 500.0));
        }
        assert_eq!(s.closes.len(), 30);
    }
}
