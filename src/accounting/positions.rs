//! Per-symbol positions snapshot.
//!
//! Uses the simpler average-cost bookkeeping that does not cross through
//! zero position: sells realize against at most the held quantity. This
//! is intentional for the snapshot; the time-series computation in
//! `accounting::realized` is the signed-position variant.

use crate::models::Side;
use crate::storage::ledger::{read_ledger, LedgerKind, LedgerRecord};
use crate::storage::tables::{write_positions, PositionRow};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Fold ledger fill rows into per-symbol snapshots.
pub fn compute_positions(rows: &[LedgerRecord]) -> BTreeMap<String, PositionRow> {
    // Join symbol/side off intent rows when a fill row omits them.
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

    let mut prev: HashMap<&str, (f64, f64)> = HashMap::new();
    let mut snaps: BTreeMap<String, PositionRow> = BTreeMap::new();

    for r in fills {
        let meta = intent_meta.get(r.tag.as_str());
        let Some(symbol) = r
            .symbol
            .as_deref()
            .or_else(|| meta.and_then(|m| m.0))
            .map(str::to_string)
        else {
            continue;
        };
        let Some(side) = r.side.or_else(|| meta.and_then(|m| m.1)) else {
            continue;
        };
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

        let pos = snaps.entry(symbol.clone()).or_insert(PositionRow {
            symbol,
            qty: 0.0,
            avg_cost: 0.0,
            realized_pnl: 0.0,
        });

        match side {
            Side::Buy => {
                let new_qty = pos.qty + q;
                pos.avg_cost = (pos.avg_cost * pos.qty + px * q) / new_qty.max(1e-9);
                pos.qty = new_qty;
            }
            Side::Sell => {
                let sell_qty = q.min(pos.qty);
                pos.realized_pnl += (px - pos.avg_cost) * sell_qty;
                pos.qty -= sell_qty;
                if pos.qty == 0.0 {
                    pos.avg_cost = 0.0;
                }
            }
        }
    }

    snaps
}

/// Recompute the snapshot from the ledger and atomically rewrite the
/// positions table. An absent ledger produces an empty table.
pub fn write_snapshot(ledger_path: &Path, out_path: &Path) -> Result<()> {
    let rows = if ledger_path.exists() {
        read_ledger(ledger_path)?
    } else {
        Vec::new()
    };
    let snaps = compute_positions(&rows);
    let out: Vec<PositionRow> = snaps.into_values().collect();
    write_positions(out_path, &out)
}
