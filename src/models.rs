//! Core wire types shared by every daemon.
//!
//! These are the records that cross process boundaries through the
//! day-partitioned tables and the intent queue, so they are plain serde
//! structs with no behavior beyond construction helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tif {
    #[serde(rename = "IOC")]
    Ioc,
    #[default]
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "GTC")]
    Gtc,
}

/// An exchange-timestamped print, immutable after construction.
///
/// `ingest_ts` is stamped by the consumer when the print is observed
/// locally, so `ingest_ts >= ts` is expected; freshness metrics discard
/// negative samples rather than clamping them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTrade {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub price: f64,
    pub size: i64,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub ingest_ts: Option<DateTime<Utc>>,
}

/// 1-second OHLCV bar keyed by the floor of the second (`ts` has
/// microseconds zeroed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar1s {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// An order intent. `tag` is the idempotency key: equal tags collapse to
/// one queue entry and at most one broker submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    #[serde(default)]
    pub tif: Tif,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub tag: Option<String>,
    pub ts: DateTime<Utc>,
}

impl NewOrder {
    /// Deterministic tag used when the strategy does not provide one:
    /// `{ts basic ISO}_{symbol}_{side}_{qty}`.
    pub fn effective_tag(&self) -> String {
        match &self.tag {
            Some(t) => t.clone(),
            None => format!(
                "{}_{}_{}_{}",
                self.ts.format("%Y%m%dT%H%M%S"),
                self.symbol,
                self.side,
                self.qty as i64
            ),
        }
    }
}
