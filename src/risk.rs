//! Pretrade risk gate.
//!
//! A synchronous predicate evaluated before any order reaches the queue
//! (engine side) or the broker (exec side). Checks short-circuit on the
//! first failure and every rejection reason carries the offending value.

use crate::models::NewOrder;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_notional: f64,
    pub price_band_bps: f64,
    pub symbol_whitelist: HashSet<String>,
    /// Presence of this file rejects everything. The only global
    /// side-band control in the system.
    pub killswitch_path: PathBuf,
    /// Ledger-derived hooks, not enforced in this revision. If wired up
    /// they must read only append-committed ledger state.
    pub max_open_orders: Option<u32>,
    pub daily_loss_stop_pct: Option<f64>,
}

impl RiskConfig {
    pub fn new(
        max_notional: f64,
        price_band_bps: f64,
        whitelist: impl IntoIterator<Item = String>,
        killswitch_path: PathBuf,
    ) -> Self {
        Self {
            max_notional,
            price_band_bps,
            symbol_whitelist: whitelist.into_iter().collect(),
            killswitch_path,
            max_open_orders: None,
            daily_loss_stop_pct: None,
        }
    }

    /// Scaled copy for the engine side, where runtime `risk_multiplier`
    /// modulates the notional cap.
    pub fn with_notional_scale(&self, mult: f64) -> Self {
        Self {
            max_notional: self.max_notional * mult,
            ..self.clone()
        }
    }
}

/// Check order: kill-switch, whitelist, notional cap, limit price band.
pub fn pretrade_check(order: &NewOrder, last_px: f64, cfg: &RiskConfig) -> (bool, String) {
    if cfg.killswitch_path.exists() {
        return (false, "killswitch active".to_string());
    }

    if !cfg.symbol_whitelist.contains(&order.symbol) {
        return (false, format!("symbol {} not in whitelist", order.symbol));
    }

    let notional = order.limit.unwrap_or(last_px) * order.qty;
    if notional > cfg.max_notional {
        return (
            false,
            format!("notional {notional:.2} > max {:.2}", cfg.max_notional),
        );
    }

    if let Some(limit) = order.limit {
        let band = last_px * cfg.price_band_bps / 10_000.0;
        if (limit - last_px).abs() > band {
            return (
                false,
                format!(
                    "limit {limit:.2} outside {:.0}bps band of last {last_px:.2}",
                    cfg.price_band_bps
                ),
            );
        }
    }

    (true, "OK".to_string())
}
