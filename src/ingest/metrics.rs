//! Feed quality metrics: ingest freshness and in-hours gap events.

use crate::models::MarketTrade;
use chrono::{NaiveTime, Weekday};
use chrono::{Datelike, Timelike};
use chrono_tz::America::New_York;

/// p99 of `ingest_ts - ts` in milliseconds. Trades without an ingest
/// timestamp are skipped; negative samples (clock skew) are discarded,
/// not clamped. Returns +inf when no usable samples exist so a silent
/// feed trips freshness alarms instead of looking perfect.
pub fn freshness_p99_ms(trades: &[MarketTrade]) -> f64 {
    let mut vals: Vec<f64> = trades
        .iter()
        .filter_map(|t| {
            let ing = t.ingest_ts?;
            let ms = (ing - t.ts).num_microseconds()? as f64 / 1_000.0;
            (ms >= 0.0).then_some(ms)
        })
        .collect();
    if vals.is_empty() {
        return f64::INFINITY;
    }
    vals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    // Linear-interpolated percentile over the sorted samples.
    let rank = 0.99 * (vals.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        vals[lo]
    } else {
        vals[lo] + (rank - lo as f64) * (vals[hi] - vals[lo])
    }
}

/// Count of gaps longer than `max_gap_sec` between consecutive prints
/// inside regular trading hours (09:30–16:00 America/New_York, weekdays).
pub fn rth_gap_events(trades: &[MarketTrade], max_gap_sec: i64) -> usize {
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();

    let mut in_hours: Vec<_> = trades
        .iter()
        .filter(|t| {
            let et = t.ts.with_timezone(&New_York);
            let wd = et.weekday();
            if wd == Weekday::Sat || wd == Weekday::Sun {
                return false;
            }
            let time = NaiveTime::from_hms_opt(et.hour(), et.minute(), et.second()).unwrap();
            time >= open && time < close
        })
        .map(|t| t.ts)
        .collect();
    in_hours.sort();

    in_hours
        .windows(2)
        .filter(|w| (w[1] - w[0]).num_seconds() > max_gap_sec)
        .count()
}
