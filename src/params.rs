//! Per-symbol runtime parameters.
//!
//! Written only by the controller, re-read by the engine before each
//! decision. Readers treat any read failure as "no change"; the previous
//! in-memory value stays in effect.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeParams {
    pub symbol: String,
    pub signal_threshold_bps: f64,
    pub risk_multiplier: f64,
    pub updated_at: String,
}

impl RuntimeParams {
    pub fn defaults(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            signal_threshold_bps: 0.5,
            risk_multiplier: 1.0,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    /// Load params, creating the file with defaults on first run so the
    /// controller always has a base value to diff against.
    pub fn load_or_init(path: &Path, symbol: &str) -> Result<Self> {
        if !path.exists() {
            let rp = Self::defaults(symbol);
            rp.save(path)?;
            return Ok(rp);
        }
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    /// Best-effort hot read for the engine loop. `None` means "no
    /// change", never an error.
    pub fn try_load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let mut out = self.clone();
        out.updated_at = Utc::now().to_rfc3339();
        let body = serde_json::to_string_pretty(&out)?;
        std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_init_creates_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("params/runtime_SPY.json");

        let rp = RuntimeParams::load_or_init(&path, "SPY").unwrap();
        assert_eq!(rp.signal_threshold_bps, 0.5);
        assert_eq!(rp.risk_multiplier, 1.0);
        assert!(path.exists());

        let again = RuntimeParams::load_or_init(&path, "SPY").unwrap();
        assert_eq!(again.symbol, "SPY");
    }

    #[test]
    fn test_save_and_hot_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runtime_SPY.json");

        let mut rp = RuntimeParams::defaults("SPY");
        rp.signal_threshold_bps = 0.7;
        rp.save(&path).unwrap();

        let read = RuntimeParams::try_load(&path).unwrap();
        assert_eq!(read.signal_threshold_bps, 0.7);
    }

    #[test]
    fn test_unreadable_is_no_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runtime_SPY.json");
        assert!(RuntimeParams::try_load(&path).is_none());

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(RuntimeParams::try_load(&path).is_none());
    }
}
