//! Parameter controller: applies advisor proposals to runtime params
//! under feed-health, drawdown, and acceptance-rate guards.
//!
//! Any failing guard sets `freeze` and the decision degrades to a no-op
//! applied row, so the acceptance-rate meter stays accurate even while
//! frozen. Applied threshold moves are clamped to [min_bps, max_bps] and
//! each step is capped at `delta_cap_bps`.

use crate::accounting::realized::{drawdown_pct_last_window, realized_pnl_timeseries, RealizedPoint};
use crate::models::{Bar1s, MarketTrade};
use crate::ops::ControllerState;
use crate::params::RuntimeParams;
use crate::paths::DataRoot;
use crate::storage::tables::{
    append_applied, read_applied, read_bars, read_proposals, read_trades, AppliedRow, ProposalRow,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub symbol: String,
    pub equity_usd: f64,
    pub min_bps: f64,
    pub max_bps: f64,
    pub delta_cap_bps: f64,
    pub lookback_min: i64,
    pub drawdown_window_min: i64,
    pub freeze_drawdown_pct: f64,
    pub max_accept_rate: f64,
}

impl ControllerConfig {
    pub fn new(symbol: &str, equity_usd: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            equity_usd,
            min_bps: 0.3,
            max_bps: 3.0,
            delta_cap_bps: 0.2,
            lookback_min: 15,
            drawdown_window_min: 30,
            freeze_drawdown_pct: -0.5,
            max_accept_rate: 0.30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guards {
    pub feed_ok: bool,
    pub drawdown_ok: bool,
    pub rate_ok: bool,
}

impl Guards {
    pub fn freeze(&self) -> bool {
        !(self.feed_ok && self.drawdown_ok && self.rate_ok)
    }
}

/// Feed health: fresh, covered bars — or failing that, a fresh trade
/// tape (bars can lag a flush interval behind the tape).
pub fn feed_health_ok(bars: &[Bar1s], trades: &[MarketTrade], now: DateTime<Utc>) -> bool {
    let minute_ago = now - Duration::seconds(60);

    if let Some(newest) = bars.iter().map(|b| b.ts).max() {
        let fresh = now - newest <= Duration::seconds(60);
        let coverage = bars.iter().filter(|b| b.ts >= minute_ago).count();
        if fresh && coverage >= 30 {
            return true;
        }
    }

    if let Some(newest) = trades.iter().map(|t| t.ts).max() {
        let fresh = now - newest <= Duration::seconds(10);
        let recent = trades.iter().filter(|t| t.ts >= minute_ago).count();
        if fresh && recent >= 20 {
            return true;
        }
    }

    false
}

/// Drawdown guard. Neutral-true with fewer than 10 realized points:
/// a near-empty series is no evidence of trouble.
pub fn drawdown_ok(
    points: &[RealizedPoint],
    cfg: &ControllerConfig,
    now: DateTime<Utc>,
) -> bool {
    if points.len() < 10 {
        return true;
    }
    let dd = drawdown_pct_last_window(points, cfg.equity_usd, cfg.drawdown_window_min, now);
    dd > cfg.freeze_drawdown_pct
}

/// Acceptance-rate guard: applied-with-nonzero-delta over proposals seen
/// in the lookback window. True when no proposals were seen.
pub fn acceptance_rate_ok(
    applied: &[AppliedRow],
    proposals: &[ProposalRow],
    cfg: &ControllerConfig,
    now: DateTime<Utc>,
) -> bool {
    let cut = now - Duration::minutes(cfg.lookback_min);
    let seen = proposals.iter().filter(|p| p.ts >= cut).count();
    if seen == 0 {
        return true;
    }
    let applied_nonzero = applied
        .iter()
        .filter(|a| a.ts >= cut && a.delta_bps != 0.0)
        .count();
    applied_nonzero as f64 / seen as f64 <= cfg.max_accept_rate
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Write new params and append a nonzero applied row.
    Apply { threshold_bps: f64, delta_bps: f64 },
    /// Append a no-op applied row (guards frozen, or the capped delta
    /// degenerated to zero).
    Noop,
    /// Nothing in the lookback window; nothing to decide.
    NoProposal,
}

/// Pure decision step over the proposals visible in the lookback window.
pub fn decide(
    current_bps: f64,
    proposals: &[ProposalRow],
    freeze: bool,
    cfg: &ControllerConfig,
    now: DateTime<Utc>,
) -> (Decision, i64) {
    let cut = now - Duration::minutes(cfg.lookback_min);
    let windowed: Vec<&ProposalRow> = proposals.iter().filter(|p| p.ts >= cut).collect();
    let seen = windowed.len() as i64;

    let Some(last) = windowed.iter().max_by_key(|p| p.ts) else {
        return (Decision::NoProposal, 0);
    };

    let proposed = last.threshold_bps.clamp(cfg.min_bps, cfg.max_bps);
    let mut delta = proposed - current_bps;
    if delta.abs() > cfg.delta_cap_bps {
        delta = cfg.delta_cap_bps.copysign(delta);
    }

    if !freeze && delta.abs() > 0.0 {
        let threshold = ((current_bps + delta) * 1000.0).round() / 1000.0;
        (
            Decision::Apply {
                threshold_bps: threshold,
                delta_bps: (delta * 1000.0).round() / 1000.0,
            },
            seen,
        )
    } else {
        (Decision::Noop, seen)
    }
}

/// One full controller iteration against the data root: evaluate guards,
/// decide, persist the outcome, refresh the state snapshot.
pub fn controller_step(
    root: &DataRoot,
    cfg: &ControllerConfig,
    params: &mut RuntimeParams,
    now: DateTime<Utc>,
) -> Result<Decision> {
    let day = now.date_naive();
    let symbol = cfg.symbol.as_str();

    let live_day = root.latest_live_day().unwrap_or(day);
    let bars = read_bars(&root.bars_path(live_day, symbol)).unwrap_or_else(|e| {
        warn!("unreadable bars for feed health: {e:#}");
        Vec::new()
    });
    let trades = read_trades(&root.trades_path(live_day, symbol)).unwrap_or_else(|e| {
        warn!("unreadable trades for feed health: {e:#}");
        Vec::new()
    });
    let realized = realized_pnl_timeseries(&root.ledger_path(day), symbol).unwrap_or_else(|e| {
        warn!("unreadable ledger for drawdown guard: {e:#}");
        Vec::new()
    });
    let proposals = read_proposals(&root.proposals_path(day, symbol)).unwrap_or_default();
    let applied_path = root.applied_path(day, symbol);
    let applied = read_applied(&applied_path).unwrap_or_default();

    let guards = Guards {
        feed_ok: feed_health_ok(&bars, &trades, now),
        drawdown_ok: drawdown_ok(&realized, cfg, now),
        rate_ok: acceptance_rate_ok(&applied, &proposals, cfg, now),
    };
    let freeze = guards.freeze();

    let (decision, seen) = decide(params.signal_threshold_bps, &proposals, freeze, cfg, now);

    match &decision {
        Decision::Apply {
            threshold_bps,
            delta_bps,
        } => {
            params.signal_threshold_bps = *threshold_bps;
            params.save(&root.runtime_params_path(symbol))?;
            append_applied(
                &applied_path,
                &AppliedRow {
                    ts: now,
                    symbol: symbol.to_string(),
                    accepted_threshold_bps: *threshold_bps,
                    delta_bps: *delta_bps,
                    seen,
                    freeze: false,
                },
            )?;
            info!(threshold_bps, delta_bps, "applied proposal");
        }
        Decision::Noop => {
            append_applied(
                &applied_path,
                &AppliedRow {
                    ts: now,
                    symbol: symbol.to_string(),
                    accepted_threshold_bps: params.signal_threshold_bps,
                    delta_bps: 0.0,
                    seen,
                    freeze,
                },
            )?;
        }
        Decision::NoProposal => {}
    }

    ControllerState {
        ts: now.to_rfc3339(),
        symbol: symbol.to_string(),
        freeze,
        feed_ok: guards.feed_ok,
        drawdown_ok: guards.drawdown_ok,
        rate_ok: guards.rate_ok,
    }
    .write(&root.controller_state_path())?;

    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 15, 0, 0).unwrap()
    }

    fn cfg() -> ControllerConfig {
        ControllerConfig::new("SPY", 30_000.0)
    }

    fn proposal(min_ago: i64, threshold: f64) -> ProposalRow {
        ProposalRow {
            ts: now() - Duration::minutes(min_ago),
            symbol: "SPY".into(),
            threshold_bps: threshold,
            risk_multiplier: 1.0,
            notes: String::new(),
            provider: "rules".into(),
            cost_usd: 0.0,
        }
    }

    #[test]
    fn test_decide_applies_capped_delta() {
        // Proposal far above current: clamped to 3.0, then capped to +0.2.
        let (d, seen) = decide(0.5, &[proposal(1, 10.0)], false, &cfg(), now());
        assert_eq!(seen, 1);
        assert_eq!(
            d,
            Decision::Apply {
                threshold_bps: 0.7,
                delta_bps: 0.2
            }
        );
    }

    #[test]
    fn test_decide_respects_bounds() {
        // Proposal below the floor clamps to 0.3; from 0.4 that is -0.1.
        let (d, _) = decide(0.4, &[proposal(1, 0.01)], false, &cfg(), now());
        assert_eq!(
            d,
            Decision::Apply {
                threshold_bps: 0.3,
                delta_bps: -0.1
            }
        );
    }

    #[test]
    fn test_decide_freeze_is_noop() {
        let (d, seen) = decide(0.5, &[proposal(1, 1.0)], true, &cfg(), now());
        assert_eq!(d, Decision::Noop);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_decide_zero_delta_is_noop() {
        let (d, _) = decide(0.5, &[proposal(1, 0.5)], false, &cfg(), now());
        assert_eq!(d, Decision::Noop);
    }

    #[test]
    fn test_decide_ignores_stale_proposals() {
        let (d, seen) = decide(0.5, &[proposal(30, 1.0)], false, &cfg(), now());
        assert_eq!(d, Decision::NoProposal);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_decide_takes_most_recent() {
        let (d, seen) = decide(
            0.5,
            &[proposal(10, 3.0), proposal(1, 0.55)],
            false,
            &cfg(),
            now(),
        );
        assert_eq!(seen, 2);
        assert_eq!(
            d,
            Decision::Apply {
                threshold_bps: 0.55,
                delta_bps: 0.05
            }
        );
    }

    fn bar(sec_ago: i64) -> Bar1s {
        Bar1s {
            ts: now() - Duration::seconds(sec_ago),
            symbol: "SPY".into(),
            open: 500.0,
            high: 500.0,
            low: 500.0,
            close: 500.0,
            volume: 1,
        }
    }

    fn trade(sec_ago: i64) -> MarketTrade {
        MarketTrade {
            ts: now() - Duration::seconds(sec_ago),
            symbol: "SPY".into(),
            price: 500.0,
            size: 1,
            venue: None,
            source: None,
            ingest_ts: None,
        }
    }

    #[test]
    fn test_feed_health_via_bars() {
        let bars: Vec<Bar1s> = (0..40).map(bar).collect();
        assert!(feed_health_ok(&bars, &[], now()));

        // Stale newest bar fails even with coverage.
        let stale: Vec<Bar1s> = (120..180).map(bar).collect();
        assert!(!feed_health_ok(&stale, &[], now()));

        // Fresh but sparse coverage fails.
        let sparse: Vec<Bar1s> = (0..10).map(bar).collect();
        assert!(!feed_health_ok(&sparse, &[], now()));
    }

    #[test]
    fn test_feed_health_trade_fallback() {
        let trades: Vec<MarketTrade> = (0..25).map(|i| trade(i * 2)).collect();
        assert!(feed_health_ok(&[], &trades, now()));

        // Fresh but thin tape fails.
        let thin: Vec<MarketTrade> = (0..5).map(trade).collect();
        assert!(!feed_health_ok(&[], &thin, now()));
    }

    #[test]
    fn test_drawdown_neutral_below_ten_points() {
        let pts: Vec<RealizedPoint> = (0..9)
            .map(|i| RealizedPoint {
                event_ts: now() - Duration::seconds(60 - i),
                symbol: "SPY".into(),
                realized_pnl_delta: -1000.0,
                realized_pnl_cum: -1000.0 * (i + 1) as f64,
                position_qty: 0.0,
                avg_cost: 0.0,
            })
            .collect();
        assert!(drawdown_ok(&pts, &cfg(), now()));
    }

    #[test]
    fn test_drawdown_trips_guard() {
        // 10+ points ending 200 below the window peak on 30k equity
        // (-0.67%) breaches the -0.5% freeze line.
        let pts: Vec<RealizedPoint> = (0..12)
            .map(|i| RealizedPoint {
                event_ts: now() - Duration::seconds(120 - i * 10),
                symbol: "SPY".into(),
                realized_pnl_delta: 0.0,
                realized_pnl_cum: if i < 6 { 0.0 } else { -200.0 },
                position_qty: 0.0,
                avg_cost: 0.0,
            })
            .collect();
        assert!(!drawdown_ok(&pts, &cfg(), now()));
    }

    #[test]
    fn test_acceptance_rate_guard() {
        let c = cfg();
        let proposals: Vec<ProposalRow> = (0..10).map(|i| proposal(i, 1.0)).collect();
        let applied_row = |min_ago: i64, delta: f64| AppliedRow {
            ts: now() - Duration::minutes(min_ago),
            symbol: "SPY".into(),
            accepted_threshold_bps: 0.5,
            delta_bps: delta,
            seen: 1,
            freeze: false,
        };

        // 3 of 10 applied = 0.30, at the limit: ok.
        let applied: Vec<AppliedRow> = (0..3).map(|i| applied_row(i, 0.1)).collect();
        assert!(acceptance_rate_ok(&applied, &proposals, &c, now()));

        // 4 of 10 breaches.
        let applied: Vec<AppliedRow> = (0..4).map(|i| applied_row(i, 0.1)).collect();
        assert!(!acceptance_rate_ok(&applied, &proposals, &c, now()));

        // No-op rows do not count against the rate.
        let applied: Vec<AppliedRow> = (0..10).map(|i| applied_row(i, 0.0)).collect();
        assert!(acceptance_rate_ok(&applied, &proposals, &c, now()));

        // No proposals: neutral true.
        assert!(acceptance_rate_ok(&applied, &[], &c, now()));
    }

    #[test]
    fn test_controller_step_applies_and_records() {
        let tmp = tempfile::tempdir().unwrap();
        let root = DataRoot::new(tmp.path());
        let c = cfg();
        let day = now().date_naive();

        // Healthy feed and a fresh proposal.
        let bars: Vec<Bar1s> = (0..40).map(bar).collect();
        crate::storage::tables::write_bars(&root.bars_path(day, "SPY"), &bars).unwrap();
        crate::storage::tables::append_proposal(
            &root.proposals_path(day, "SPY"),
            &proposal(1, 1.0),
        )
        .unwrap();

        let mut params = RuntimeParams::defaults("SPY");
        let d = controller_step(&root, &c, &mut params, now()).unwrap();
        assert_eq!(
            d,
            Decision::Apply {
                threshold_bps: 0.7,
                delta_bps: 0.2
            }
        );
        assert_eq!(params.signal_threshold_bps, 0.7);

        let applied = read_applied(&root.applied_path(day, "SPY")).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].delta_bps, 0.2);
        assert!(!applied[0].freeze);

        let saved = RuntimeParams::try_load(&root.runtime_params_path("SPY")).unwrap();
        assert_eq!(saved.signal_threshold_bps, 0.7);
        assert!(root.controller_state_path().exists());
    }

    #[test]
    fn test_controller_step_frozen_writes_noop_row() {
        let tmp = tempfile::tempdir().unwrap();
        let root = DataRoot::new(tmp.path());
        let c = cfg();
        let day = now().date_naive();

        // No feed at all → frozen; proposal present → no-op row.
        crate::storage::tables::append_proposal(
            &root.proposals_path(day, "SPY"),
            &proposal(1, 1.0),
        )
        .unwrap();

        let mut params = RuntimeParams::defaults("SPY");
        let d = controller_step(&root, &c, &mut params, now()).unwrap();
        assert_eq!(d, Decision::Noop);
        assert_eq!(params.signal_threshold_bps, 0.5);

        let applied = read_applied(&root.applied_path(day, "SPY")).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].delta_bps, 0.0);
        assert!(applied[0].freeze);

        let raw = std::fs::read_to_string(root.controller_state_path()).unwrap();
        assert!(raw.contains("\"freeze\": true"));
    }
}
