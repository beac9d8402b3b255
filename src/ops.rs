//! Operational plumbing shared by the daemons: tracing setup, heartbeat
//! files, and the controller state snapshot.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Install the fmt subscriber with RUST_LOG-style filtering, defaulting
/// the daemon's own target to info.
pub fn init_tracing(service: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("{service}=info").parse().unwrap())
                .add_directive("tapeline=info".parse().unwrap()),
        )
        .init();
}

/// Touch the service heartbeat file: `{"ts": <ISO8601>}`. Every daemon
/// calls this at least every 30s (each loop iteration in practice).
pub fn beat(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let body = serde_json::json!({ "ts": Utc::now().to_rfc3339() });
    std::fs::write(path, body.to_string()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Controller guard snapshot, refreshed every controller iteration even
/// when no proposal is in scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerState {
    pub ts: String,
    pub symbol: String,
    pub freeze: bool,
    pub feed_ok: bool,
    pub drawdown_ok: bool,
    pub rate_ok: bool,
}

impl ControllerState {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
