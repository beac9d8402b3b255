//! Synthetic random-walk tape for paper sessions and local runs.

use super::TradeSource;
use crate::models::MarketTrade;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

pub struct SyntheticTrades {
    symbol: String,
    px: f64,
    tick_interval: Duration,
    rng: StdRng,
}

impl SyntheticTrades {
    pub fn new(symbol: &str, start_px: f64, tick_interval: Duration) -> Self {
        Self {
            symbol: symbol.to_string(),
            px: start_px,
            tick_interval,
            rng: StdRng::from_entropy(),
        }
    }
}

#[async_trait]
impl TradeSource for SyntheticTrades {
    async fn next_trade(&mut self) -> Result<Option<MarketTrade>> {
        tokio::time::sleep(self.tick_interval).await;

        // Small gaussian-ish drift from summed uniforms; price floors at 1.
        let drift: f64 = (0..4).map(|_| self.rng.gen_range(-0.01..=0.01)).sum();
        self.px = (self.px + drift).max(1.0);
        let size = self.rng.gen_range(1..=200);

        Ok(Some(MarketTrade {
            ts: Utc::now(),
            symbol: self.symbol.clone(),
            price: self.px,
            size,
            venue: None,
            source: Some("synthetic".to_string()),
            ingest_ts: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_positive_prints() {
        let mut src = SyntheticTrades::new("SPY", 500.0, Duration::from_millis(1));
        for _ in 0..10 {
            let t = src.next_trade().await.unwrap().unwrap();
            assert_eq!(t.symbol, "SPY");
            assert!(t.price > 0.0);
            assert!(t.size > 0);
            assert!(t.ingest_ts.is_none());
        }
    }
}
