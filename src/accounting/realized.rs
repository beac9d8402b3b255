//! Realized P&L reconstruction from the ledger.
//!
//! Fill rows record the incremental `fill_qty` and the cumulative
//! `avg_px` after each fill of a tag. Per-fill prices are recovered
//! per tag, then applied in `event_ts` order across all tags with
//! signed-position average-cost accounting. This is the variant that
//! crosses through zero; the positions snapshot deliberately uses the
//! simpler one (see `accounting::positions`).

use crate::models::Side;
use crate::storage::ledger::{read_ledger, LedgerKind, LedgerRecord};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct RealizedPoint {
    pub event_ts: DateTime<Utc>,
    pub symbol: String,
    pub realized_pnl_delta: f64,
    pub realized_pnl_cum: f64,
    pub position_qty: f64,
    pub avg_cost: f64,
}

#[derive(Debug, Clone)]
struct RecoveredFill {
    event_ts: DateTime<Utc>,
    tag: String,
    side: Side,
    qty: f64,
    px: f64,
}

/// Recover per-fill prices from cumulative averages, per tag:
/// `p_i = A_i` when the tag had no prior fills, else
/// `(A_i*Q_i - A_{i-1}*Q_{i-1}) / q_i`.
fn recover_fills(rows: &[LedgerRecord], symbol: &str) -> Vec<RecoveredFill> {
    // Intent rows supply symbol/side for fill rows that omit them.
    let mut intent_meta: HashMap<&str, (Option<&str>, Option<Side>)> = HashMap::new();
    for r in rows {
        if matches!(r.kind, LedgerKind::Intent | LedgerKind::IntentShadow) {
            intent_meta
                .entry(r.tag.as_str())
                .or_insert((r.symbol.as_deref(), r.side));
        }
    }

    let mut fills: Vec<&LedgerRecord> = rows.iter().filter(|r| r.kind.is_fill_event()).collect();
    fills.sort_by(|a, b| (a.tag.as_str(), a.order_ts()).cmp(&(b.tag.as_str(), b.order_ts())));

    let mut prev: HashMap<&str, (f64, f64)> = HashMap::new(); // tag -> (Q_prev, A_prev)
    let mut out = Vec::new();
    for r in fills {
        let meta = intent_meta.get(r.tag.as_str());
        let sym = r
            .symbol
            .as_deref()
            .or_else(|| meta.and_then(|m| m.0))
            .unwrap_or_default();
        let Some(side) = r.side.or_else(|| meta.and_then(|m| m.1)) else {
            continue;
        };
        if sym != symbol {
            continue;
        }
        let q = r.fill_qty.unwrap_or(0.0);
        let a = r.avg_px.unwrap_or(0.0);
        if q <= 0.0 || a <= 0.0 {
            continue;
        }

        let (q_prev, a_prev) = prev.get(r.tag.as_str()).copied().unwrap_or((0.0, 0.0));
        let q_new = q_prev + q;
        let px = if q_prev == 0.0 {
            a
        } else {
            (a * q_new - a_prev * q_prev) / q
        };
        prev.insert(r.tag.as_str(), (q_new, a));

        out.push(RecoveredFill {
            event_ts: r.order_ts(),
            tag: r.tag.clone(),
            side,
            qty: q,
            px,
        });
    }

    out.sort_by(|a, b| (a.event_ts, a.tag.as_str()).cmp(&(b.event_ts, b.tag.as_str())));
    out
}

/// Signed-position average-cost realized P&L time series for `symbol`.
pub fn realized_pnl_timeseries(ledger_path: &Path, symbol: &str) -> Result<Vec<RealizedPoint>> {
    let rows = read_ledger(ledger_path)?;
    Ok(realized_from_records(&rows, symbol))
}

pub fn realized_from_records(rows: &[LedgerRecord], symbol: &str) -> Vec<RealizedPoint> {
    let fills = recover_fills(rows, symbol);

    let mut pos = 0.0_f64;
    let mut avg_cost = 0.0_f64;
    let mut cum = 0.0_f64;
    let mut out = Vec::with_capacity(fills.len());

    for f in fills {
        let mut q = f.qty;
        let px = f.px;
        let mut delta = 0.0;

        match f.side {
            Side::Buy => {
                if pos < 0.0 {
                    // Covering short realizes against the short cost.
                    let matched = q.min(-pos);
                    delta += (avg_cost - px) * matched;
                    pos += matched;
                    q -= matched;
                    if q > 0.0 {
                        avg_cost = px;
                        pos += q;
                    }
                } else {
                    let new_pos = pos + q;
                    avg_cost = (avg_cost * pos + px * q) / new_pos;
                    pos = new_pos;
                }
            }
            Side::Sell => {
                if pos > 0.0 {
                    let matched = q.min(pos);
                    delta += (px - avg_cost) * matched;
                    pos -= matched;
                    q -= matched;
                    if q > 0.0 {
                        avg_cost = px;
                        pos -= q;
                    }
                } else {
                    // Extending (or opening) short: weighted-average short cost.
                    let size = -pos;
                    let new_size = size + q;
                    avg_cost = if pos < 0.0 {
                        (avg_cost * size + px * q) / new_size
                    } else {
                        px
                    };
                    pos -= q;
                }
            }
        }

        cum += delta;
        out.push(RealizedPoint {
            event_ts: f.event_ts,
            symbol: symbol.to_string(),
            realized_pnl_delta: delta,
            realized_pnl_cum: cum,
            position_qty: pos,
            avg_cost,
        });
    }

    out
}

/// Drawdown of `realized_pnl_cum` over the trailing window, as a percent
/// of equity (<= 0): window peak minus current, over equity.
pub fn drawdown_pct_last_window(
    points: &[RealizedPoint],
    equity_usd: f64,
    window_min: i64,
    now: DateTime<Utc>,
) -> f64 {
    if equity_usd <= 0.0 || points.is_empty() {
        return 0.0;
    }
    let cut = now - Duration::minutes(window_min);
    let windowed: Vec<&RealizedPoint> = points.iter().filter(|p| p.event_ts >= cut).collect();
    let Some(last) = windowed.last() else {
        return 0.0;
    };
    let cur = last.realized_pnl_cum;
    let peak = windowed
        .iter()
        .map(|p| p.realized_pnl_cum)
        .fold(f64::NEG_INFINITY, f64::max);
    (cur - peak) / equity_usd * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ledger::LedgerKind;
    use chrono::TimeZone;

    fn t(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, sec).unwrap()
    }

    fn fill(tag: &str, sec: u32, side: Side, fill_qty: f64, avg_px: f64) -> LedgerRecord {
        let mut r = LedgerRecord::new(LedgerKind::Fill, tag, t(sec));
        r.event_ts = Some(t(sec));
        r.symbol = Some("SPY".into());
        r.side = Some(side);
        r.fill_qty = Some(fill_qty);
        r.avg_px = Some(avg_px);
        r
    }

    #[test]
    fn test_two_buys_one_sell() {
        // BUY 1@100, BUY 1@102 (cum avg 101.0 on a shared tag), SELL 1@101.5.
        let rows = vec![
            fill("t1", 0, Side::Buy, 1.0, 100.0),
            fill("t1", 1, Side::Buy, 1.0, 101.0),
            fill("t2", 2, Side::Sell, 1.0, 101.5),
        ];
        let pts = realized_from_records(&rows, "SPY");
        assert_eq!(pts.len(), 3);

        let last = pts.last().unwrap();
        assert!((last.position_qty - 1.0).abs() < 1e-9);
        assert!((last.avg_cost - 101.0).abs() < 1e-9);
        assert!((last.realized_pnl_cum - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_round_trip_flat_with_expected_pnl() {
        let rows = vec![
            fill("a", 0, Side::Buy, 2.0, 100.0),
            fill("b", 1, Side::Sell, 2.0, 101.0),
        ];
        let pts = realized_from_records(&rows, "SPY");
        let last = pts.last().unwrap();
        assert_eq!(last.position_qty, 0.0);
        assert!((last.realized_pnl_cum - 2.0).abs() < 1e-9);

        let sum: f64 = pts.iter().map(|p| p.realized_pnl_delta).sum();
        assert!((sum - last.realized_pnl_cum).abs() < 1e-9);
    }

    #[test]
    fn test_sell_crosses_through_zero() {
        // Long 1@100, sell 3@102: realize +2 on the matched unit, then
        // open a short of 2 at 102.
        let rows = vec![
            fill("a", 0, Side::Buy, 1.0, 100.0),
            fill("b", 1, Side::Sell, 3.0, 102.0),
        ];
        let pts = realized_from_records(&rows, "SPY");
        let last = pts.last().unwrap();
        assert!((last.position_qty + 2.0).abs() < 1e-9);
        assert!((last.avg_cost - 102.0).abs() < 1e-9);
        assert!((last.realized_pnl_cum - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_cover() {
        let rows = vec![
            fill("a", 0, Side::Sell, 2.0, 100.0),
            fill("b", 1, Side::Buy, 2.0, 99.0),
        ];
        let pts = realized_from_records(&rows, "SPY");
        let last = pts.last().unwrap();
        assert_eq!(last.position_qty, 0.0);
        assert!((last.realized_pnl_cum - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_per_fill_price_recovery_from_cumulative_avg() {
        // Cumulative averages 100 then 101 recover per-fill prices
        // 100 and 102; avg cost is 101, so selling 2@103 realizes +4.
        let rows = vec![
            fill("t1", 0, Side::Buy, 1.0, 100.0),
            fill("t1", 1, Side::Buy, 1.0, 101.0),
            fill("t2", 2, Side::Sell, 2.0, 103.0),
        ];
        let pts = realized_from_records(&rows, "SPY");
        let last = pts.last().unwrap();
        assert_eq!(last.position_qty, 0.0);
        assert!((last.realized_pnl_cum - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_fill_symbol_joined_from_intent() {
        let mut intent = LedgerRecord::new(LedgerKind::Intent, "t1", t(0));
        intent.symbol = Some("SPY".into());
        intent.side = Some(Side::Buy);
        intent.qty = Some(1.0);

        let mut bare_fill = LedgerRecord::new(LedgerKind::Fill, "t1", t(1));
        bare_fill.event_ts = Some(t(1));
        bare_fill.fill_qty = Some(1.0);
        bare_fill.avg_px = Some(100.0);

        let pts = realized_from_records(&[intent, bare_fill], "SPY");
        assert_eq!(pts.len(), 1);
        assert!((pts[0].position_qty - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_window() {
        let now = t(120);
        let mk = |sec: u32, cum: f64| RealizedPoint {
            event_ts: t(sec),
            symbol: "SPY".into(),
            realized_pnl_delta: 0.0,
            realized_pnl_cum: cum,
            position_qty: 0.0,
            avg_cost: 0.0,
        };
        let pts = vec![mk(100, 0.0), mk(110, 150.0), mk(115, 0.0)];
        // Peak 150, current 0 → -150 on 30k equity = -0.5%.
        let dd = drawdown_pct_last_window(&pts, 30_000.0, 30, now);
        assert!((dd + 0.5).abs() < 1e-9);

        // Empty window.
        assert_eq!(drawdown_pct_last_window(&pts, 30_000.0, 0, t(3600)), 0.0);
        // No equity.
        assert_eq!(drawdown_pct_last_window(&pts, 0.0, 30, now), 0.0);
    }
}
