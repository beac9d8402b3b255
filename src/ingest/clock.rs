//! Feed-keyed monotonic clock.

use chrono::{DateTime, Utc};

/// Monotonic watermark keyed to feed timestamps, with wall clock as the
/// fallback. A late out-of-order print observes the watermark but cannot
/// move it backwards, so flush boundaries derived from it never regress.
#[derive(Debug, Default)]
pub struct FeedClock {
    watermark: Option<DateTime<Utc>>,
}

impl FeedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance from a feed timestamp and return the current watermark.
    pub fn tick_from_feed(&mut self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self.watermark {
            Some(w) if ts < w => w,
            _ => {
                self.watermark = Some(ts);
                ts
            }
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_watermark_never_regresses() {
        let mut clock = FeedClock::new();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 2, 14, 30, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);

        assert_eq!(clock.tick_from_feed(t0), t0);
        assert_eq!(clock.tick_from_feed(t1), t1);
        // Late print: watermark holds.
        assert_eq!(clock.tick_from_feed(t0), t1);
        assert_eq!(clock.watermark(), Some(t1));
    }
}
