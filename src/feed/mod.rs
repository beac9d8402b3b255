//! Trade source port.
//!
//! A lazy, effectively infinite async sequence of prints scoped to one
//! symbol. Cancellation is cooperative: dropping the source stops it.
//! Live venue implementations (Alpaca stream, IBKR gateway) sit behind
//! this trait, own their reconnect loop (1s backoff between attempts),
//! and do NOT stamp `ingest_ts` — the consumer tags observation time so
//! freshness measures the whole path.

pub mod replay;
pub mod synthetic;

use crate::models::MarketTrade;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TradeSource: Send {
    /// Next print, or `None` when the source is exhausted (a live
    /// source never is; replay ends with its recording).
    async fn next_trade(&mut self) -> Result<Option<MarketTrade>>;
}
