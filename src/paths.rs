//! Day-partitioned data root layout.
//!
//! Every inter-daemon artifact lives under a single root directory;
//! daemons never exchange state any other way.

use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Resolver for the on-disk layout:
///
/// ```text
/// live/{YYYY-MM-DD}/trades_{SYM}.parquet
/// live/{YYYY-MM-DD}/bars1s_{SYM}.parquet
/// exec/{YYYY-MM-DD}/ledger.parquet
/// exec/{YYYY-MM-DD}/shadow_ledger.parquet
/// exec/{YYYY-MM-DD}/positions.parquet
/// llm/{YYYY-MM-DD}/proposals_{SYM}.parquet
/// llm/{YYYY-MM-DD}/applied_{SYM}.parquet
/// params/runtime_{SYM}.json
/// ops/heartbeat/{service}.json
/// ops/controller_state.json
/// queue.db
/// RUN/HALT
/// ```
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn day_dir(&self, area: &str, day: NaiveDate) -> PathBuf {
        self.root.join(area).join(day.format("%Y-%m-%d").to_string())
    }

    pub fn live_dir(&self, day: NaiveDate) -> PathBuf {
        self.day_dir("live", day)
    }

    pub fn trades_path(&self, day: NaiveDate, symbol: &str) -> PathBuf {
        self.live_dir(day).join(format!("trades_{symbol}.parquet"))
    }

    pub fn bars_path(&self, day: NaiveDate, symbol: &str) -> PathBuf {
        self.live_dir(day).join(format!("bars1s_{symbol}.parquet"))
    }

    pub fn ledger_path(&self, day: NaiveDate) -> PathBuf {
        self.day_dir("exec", day).join("ledger.parquet")
    }

    pub fn shadow_ledger_path(&self, day: NaiveDate) -> PathBuf {
        self.day_dir("exec", day).join("shadow_ledger.parquet")
    }

    pub fn positions_path(&self, day: NaiveDate) -> PathBuf {
        self.day_dir("exec", day).join("positions.parquet")
    }

    pub fn proposals_path(&self, day: NaiveDate, symbol: &str) -> PathBuf {
        self.day_dir("llm", day)
            .join(format!("proposals_{symbol}.parquet"))
    }

    pub fn applied_path(&self, day: NaiveDate, symbol: &str) -> PathBuf {
        self.day_dir("llm", day)
            .join(format!("applied_{symbol}.parquet"))
    }

    pub fn runtime_params_path(&self, symbol: &str) -> PathBuf {
        self.root.join("params").join(format!("runtime_{symbol}.json"))
    }

    pub fn heartbeat_path(&self, service: &str) -> PathBuf {
        self.root
            .join("ops")
            .join("heartbeat")
            .join(format!("{service}.json"))
    }

    pub fn controller_state_path(&self) -> PathBuf {
        self.root.join("ops").join("controller_state.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.root.join("queue.db")
    }

    /// Kill-switch: presence of this file blocks all new orders.
    pub fn killswitch_path(&self) -> PathBuf {
        self.root.join("RUN").join("HALT")
    }

    /// Latest day directory under `live/`, by lexicographic (= date) order.
    pub fn latest_live_day(&self) -> Option<NaiveDate> {
        let live = self.root.join("live");
        let mut days: Vec<NaiveDate> = std::fs::read_dir(live)
            .ok()?
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                NaiveDate::parse_from_str(&e.file_name().to_string_lossy(), "%Y-%m-%d").ok()
            })
            .collect();
        days.sort();
        days.pop()
    }
}
