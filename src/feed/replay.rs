//! Paced replay of a recorded trades table.
//!
//! Preserves original inter-trade spacing scaled by a speed multiplier,
//! so a recorded session can drive the full paper pipeline at (or
//! faster than) real time.

use super::TradeSource;
use crate::models::MarketTrade;
use crate::storage::tables::read_trades;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

pub struct ReplayTrades {
    trades: std::vec::IntoIter<MarketTrade>,
    /// Next print, held across polls: `next_trade` futures get dropped
    /// by callers' select loops, and a popped trade must survive that.
    pending: Option<MarketTrade>,
    speed: f64,
    epoch: Option<(Instant, DateTime<Utc>)>,
}

impl ReplayTrades {
    pub fn open(path: &Path, speed: f64) -> Result<Self> {
        if speed <= 0.0 {
            bail!("replay speed must be positive, got {speed}");
        }
        let mut trades = read_trades(path)?;
        trades.sort_by_key(|t| t.ts);
        Ok(Self {
            trades: trades.into_iter(),
            pending: None,
            speed,
            epoch: None,
        })
    }
}

#[async_trait]
impl TradeSource for ReplayTrades {
    async fn next_trade(&mut self) -> Result<Option<MarketTrade>> {
        if self.pending.is_none() {
            self.pending = self.trades.next();
        }
        let Some(trade) = self.pending.as_ref() else {
            return Ok(None);
        };

        let ts = trade.ts;
        let (wall0, t0) = *self.epoch.get_or_insert((Instant::now(), ts));
        let offset = (ts - t0)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .div_f64(self.speed);
        tokio::time::sleep_until(wall0 + offset).await;

        let mut trade = self.pending.take().unwrap();
        // Replayed prints are re-observed now; the stale recorded
        // ingest_ts would poison freshness metrics.
        trade.ingest_ts = None;
        Ok(Some(trade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tables::write_trades;
    use chrono::TimeZone;

    fn trade(sec: u32) -> MarketTrade {
        MarketTrade {
            ts: Utc.with_ymd_and_hms(2025, 1, 2, 14, 30, sec).unwrap(),
            symbol: "SPY".into(),
            price: 500.0 + sec as f64,
            size: 1,
            venue: None,
            source: Some("recorded".into()),
            ingest_ts: Some(Utc.with_ymd_and_hms(2025, 1, 2, 14, 30, sec).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_replays_in_order_then_ends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades_SPY.parquet");
        // Out of order on disk; replay sorts.
        write_trades(&path, &[trade(2), trade(0), trade(1)]).unwrap();

        // Generous speed so three seconds of tape replay instantly.
        let mut src = ReplayTrades::open(&path, 10_000.0).unwrap();
        let mut prices = Vec::new();
        while let Some(t) = src.next_trade().await.unwrap() {
            assert!(t.ingest_ts.is_none());
            prices.push(t.price);
        }
        assert_eq!(prices, vec![500.0, 501.0, 502.0]);
    }

    #[tokio::test]
    async fn test_bad_speed_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades_SPY.parquet");
        write_trades(&path, &[trade(0)]).unwrap();
        assert!(ReplayTrades::open(&path, 0.0).is_err());
    }
}
