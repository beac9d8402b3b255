//! Decision engine: strategy + risk gate + hot runtime params.

use crate::models::{Bar1s, NewOrder};
use crate::params::RuntimeParams;
use crate::risk::{pretrade_check, RiskConfig};
use crate::strategy::MeanReversion1s;
use std::path::PathBuf;
use tracing::debug;

/// Evaluates the strategy on each new bar under the risk gate.
///
/// Runtime params are re-read before every decision; a failed read
/// leaves the previous threshold and multiplier in effect.
pub struct DecisionEngine {
    strategy: MeanReversion1s,
    risk: RiskConfig,
    params_path: PathBuf,
    risk_multiplier: f64,
    last_px: Option<f64>,
}

impl DecisionEngine {
    pub fn new(
        symbol: &str,
        risk: RiskConfig,
        params_path: PathBuf,
        threshold_bps: f64,
        window: usize,
    ) -> Self {
        Self {
            strategy: MeanReversion1s::new(symbol, threshold_bps, window),
            risk,
            params_path,
            risk_multiplier: 1.0,
            last_px: None,
        }
    }

    pub fn last_px(&self) -> Option<f64> {
        self.last_px
    }

    /// Run one bar through params reload, strategy, and risk gate;
    /// returns the accepted intents.
    pub fn on_bar(&mut self, bar: &Bar1s) -> Vec<NewOrder> {
        if let Some(p) = RuntimeParams::try_load(&self.params_path) {
            self.strategy.set_threshold_bps(p.signal_threshold_bps);
            self.risk_multiplier = p.risk_multiplier;
        }

        self.last_px = Some(bar.close);
        let gate = self.risk.with_notional_scale(self.risk_multiplier);

        self.strategy
            .on_bar(bar)
            .into_iter()
            .filter(|o| {
                let (ok, reason) = pretrade_check(o, bar.close, &gate);
                if !ok {
                    debug!(tag = %o.effective_tag(), %reason, "intent rejected by engine gate");
                }
                ok
            })
            .collect()
    }
}
