//! Parameter advisor: market features → parameter proposals.
//!
//! Providers are a tagged variant with a single `propose` operation;
//! adding a provider means adding a variant, not a trait impl. The rules
//! provider is free; priced providers draw down the advisor budget and
//! an exhausted budget pauses proposals for five minutes.

use crate::models::Bar1s;
use crate::storage::tables::ProposalRow;
use chrono::{DateTime, Duration, Utc};

pub const FEATURE_WINDOW_SEC: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub realized_vol_bps: f64,
    pub spread_proxy_bps: f64,
    pub trend_bps: f64,
}

/// Features over a bar window:
/// realized vol = 1e4 * sqrt(mean(r_i^2)) of close-to-close returns,
/// spread proxy = 1e4 * median((high-low)/close),
/// trend = 1e4 * (c_n/c_0 - 1).
pub fn compute_features(bars: &[Bar1s]) -> Features {
    if bars.is_empty() {
        return Features {
            realized_vol_bps: 0.0,
            spread_proxy_bps: 0.0,
            trend_bps: 0.0,
        };
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let rets: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let realized_vol_bps = if rets.is_empty() {
        0.0
    } else {
        (rets.iter().map(|r| r * r).sum::<f64>() / rets.len() as f64).sqrt() * 1e4
    };

    let mut ranges: Vec<f64> = bars
        .iter()
        .map(|b| (b.high - b.low).max(0.0) / if b.close != 0.0 { b.close } else { 1.0 } * 1e4)
        .collect();
    ranges.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let spread_proxy_bps = if ranges.is_empty() {
        0.0
    } else if ranges.len() % 2 == 1 {
        ranges[ranges.len() / 2]
    } else {
        (ranges[ranges.len() / 2 - 1] + ranges[ranges.len() / 2]) / 2.0
    };

    let trend_bps = if closes.len() > 1 && closes[0] != 0.0 {
        (closes[closes.len() - 1] / closes[0] - 1.0) * 1e4
    } else {
        0.0
    };

    Features {
        realized_vol_bps,
        spread_proxy_bps,
        trend_bps,
    }
}

/// Bars within the trailing feature window, measured from the newest bar.
pub fn bars_window(bars: &[Bar1s], window_sec: i64) -> Vec<Bar1s> {
    let Some(newest) = bars.iter().map(|b| b.ts).max() else {
        return Vec::new();
    };
    let cutoff = newest - Duration::seconds(window_sec);
    bars.iter().filter(|b| b.ts > cutoff).cloned().collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub threshold_bps: f64,
    pub risk_multiplier: f64,
    pub notes: String,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Rules,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Provider> {
        match s.to_ascii_lowercase().as_str() {
            "rules" | "default" | "local" => Some(Provider::Rules),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Rules => "rules",
        }
    }

    pub fn propose(&self, f: &Features) -> ProviderResponse {
        match self {
            Provider::Rules => rules_propose(f),
        }
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Raise the threshold and cut risk when vol expands or the spread
/// proxy widens; strong trend makes the threshold more conservative.
fn rules_propose(f: &Features) -> ProviderResponse {
    let vol = f.realized_vol_bps;
    let spr = f.spread_proxy_bps;
    let trend = f.trend_bps;

    let mut th = (0.5 + 0.03 * (vol - 5.0) + 0.02 * (spr - 1.0)).clamp(0.3, 3.0);
    if trend.abs() > 5.0 {
        th *= 1.2;
    }
    let risk_mult = (1.0 - 0.03 * (vol - 5.0) - 0.02 * (spr - 1.0)).clamp(0.25, 1.5);

    ProviderResponse {
        threshold_bps: round3(th),
        risk_multiplier: round3(risk_mult),
        notes: format!("vol={vol:.1} spr={spr:.1} trend={trend:.1}"),
        cost_usd: 0.0,
    }
}

/// Build the proposal row appended to the per-day proposals table.
pub fn make_proposal(
    symbol: &str,
    bars: &[Bar1s],
    provider: Provider,
    ts: DateTime<Utc>,
) -> ProposalRow {
    let window = bars_window(bars, FEATURE_WINDOW_SEC);
    let feats = compute_features(&window);
    let resp = provider.propose(&feats);
    ProposalRow {
        ts,
        symbol: symbol.to_string(),
        threshold_bps: resp.threshold_bps,
        risk_multiplier: resp.risk_multiplier,
        notes: resp.notes,
        provider: provider.name().to_string(),
        cost_usd: resp.cost_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(sec: i64, close: f64, range: f64) -> Bar1s {
        Bar1s {
            ts: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(sec),
            symbol: "SPY".into(),
            open: close,
            high: close + range / 2.0,
            low: close - range / 2.0,
            close,
            volume: 10,
        }
    }

    #[test]
    fn test_flat_tape_features() {
        let bars: Vec<Bar1s> = (0..60).map(|i| bar(i, 500.0, 0.0)).collect();
        let f = compute_features(&bars);
        assert_eq!(f.realized_vol_bps, 0.0);
        assert_eq!(f.spread_proxy_bps, 0.0);
        assert_eq!(f.trend_bps, 0.0);
    }

    #[test]
    fn test_trend_feature() {
        let bars: Vec<Bar1s> = (0..100)
            .map(|i| bar(i, 500.0 + i as f64 * 0.01, 0.1))
            .collect();
        let f = compute_features(&bars);
        // ~0.99 move on 500 ≈ 19.8bps.
        assert!(f.trend_bps > 15.0 && f.trend_bps < 25.0);
        assert!(f.realized_vol_bps > 0.0);
        assert!(f.spread_proxy_bps > 0.0);
    }

    #[test]
    fn test_rules_baseline_inputs() {
        // vol=5, spr=1 sits exactly at the base threshold.
        let f = Features {
            realized_vol_bps: 5.0,
            spread_proxy_bps: 1.0,
            trend_bps: 0.0,
        };
        let r = rules_propose(&f);
        assert!((r.threshold_bps - 0.5).abs() < 1e-9);
        assert!((r.risk_multiplier - 1.0).abs() < 1e-9);
        assert_eq!(r.cost_usd, 0.0);
    }

    #[test]
    fn test_rules_clamps() {
        let calm = Features {
            realized_vol_bps: 0.0,
            spread_proxy_bps: 0.0,
            trend_bps: 0.0,
        };
        let r = rules_propose(&calm);
        // Zero vol/spread bottoms out at 0.33, above the 0.3 floor.
        assert!((r.threshold_bps - 0.33).abs() < 1e-9);
        assert!((r.risk_multiplier - 1.17).abs() < 1e-9);

        let wild = Features {
            realized_vol_bps: 200.0,
            spread_proxy_bps: 50.0,
            trend_bps: 0.0,
        };
        let r = rules_propose(&wild);
        assert!((r.threshold_bps - 3.0).abs() < 1e-9);
        assert!((r.risk_multiplier - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_strong_trend_scales_threshold() {
        let f = Features {
            realized_vol_bps: 5.0,
            spread_proxy_bps: 1.0,
            trend_bps: 10.0,
        };
        let r = rules_propose(&f);
        assert!((r.threshold_bps - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_window_filter() {
        let bars: Vec<Bar1s> = (0..300).map(|i| bar(i, 500.0, 0.1)).collect();
        let w = bars_window(&bars, FEATURE_WINDOW_SEC);
        // (newest - 120s, newest] at one bar per second.
        assert_eq!(w.len(), 120);
        assert!(w.iter().all(|b| b.ts > bars[299].ts - Duration::seconds(120)));
    }

    #[test]
    fn test_make_proposal_row() {
        let bars: Vec<Bar1s> = (0..120).map(|i| bar(i, 500.0, 0.05)).collect();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap();
        let row = make_proposal("SPY", &bars, Provider::Rules, ts);
        assert_eq!(row.provider, "rules");
        assert_eq!(row.symbol, "SPY");
        assert!(row.threshold_bps >= 0.3 && row.threshold_bps <= 3.0);
        assert!(row.notes.starts_with("vol="));
    }
}
