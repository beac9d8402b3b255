//! Deterministic trade → 1s bar aggregation.

use crate::models::{Bar1s, MarketTrade};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

struct BarAccum {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
}

/// Aggregate an unordered batch of trades into ascending 1s OHLCV bars
/// for `symbol`. Bucket key is the floor of the second; only buckets
/// with at least one trade produce a bar. Ties on `ts` keep input order
/// (stable sort), so `open`/`close` are deterministic for any input
/// permutation of distinct timestamps.
///
/// Pure and restartable: callers may re-aggregate any window, which is
/// also how late trades for an already-written bucket get merged.
pub fn aggregate_trades_to_1s_bars(trades: &[MarketTrade], symbol: &str) -> Vec<Bar1s> {
    let mut sorted: Vec<&MarketTrade> = trades.iter().filter(|t| t.symbol == symbol).collect();
    sorted.sort_by_key(|t| t.ts);

    let mut buckets: BTreeMap<i64, BarAccum> = BTreeMap::new();
    for t in sorted {
        let key = t.ts.timestamp();
        match buckets.get_mut(&key) {
            None => {
                buckets.insert(
                    key,
                    BarAccum {
                        open: t.price,
                        high: t.price,
                        low: t.price,
                        close: t.price,
                        volume: t.size,
                    },
                );
            }
            Some(b) => {
                b.high = b.high.max(t.price);
                b.low = b.low.min(t.price);
                b.close = t.price;
                b.volume += t.size;
            }
        }
    }

    buckets
        .into_iter()
        .map(|(sec, b)| Bar1s {
            ts: DateTime::<Utc>::from_timestamp(sec, 0).unwrap_or_default(),
            symbol: symbol.to_string(),
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
        })
        .collect()
}
