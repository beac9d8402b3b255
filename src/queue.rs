//! Durable at-least-once intent queue.
//!
//! Single-file SQLite store shared by engined (enqueue) and execd
//! (reserve/ack/nack). WAL journal with synchronous=NORMAL, so every
//! mutation is committed before the call returns and a writer crash
//! after commit is recoverable. `(topic, tag)` is unique: re-enqueueing
//! an already-seen tag is a no-op, which is what makes engine restarts
//! and bar re-reads safe.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    payload TEXT NOT NULL,
    tag TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',   -- queued|processing|done|dead
    enqueued_ts INTEGER NOT NULL,            -- unix micros
    dequeued_ts INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_queue_topic_tag ON queue(topic, tag);
CREATE INDEX IF NOT EXISTS ix_queue_topic_status_id ON queue(topic, status, id);
"#;

/// A reserved message. The reservation is held until `ack`/`nack`, or
/// until the visibility timeout elapses and a later `reserve` takes it
/// over.
#[derive(Debug, Clone)]
pub struct Reserved {
    pub id: i64,
    pub tag: String,
    pub payload: String,
}

/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct IntentQueue {
    conn: Arc<Mutex<Connection>>,
}

impl IntentQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path.as_ref(), flags)
            .with_context(|| format!("open queue at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initialize queue schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert if `(topic, tag)` is unseen; otherwise a no-op.
    pub fn enqueue(&self, topic: &str, tag: &str, payload: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO queue (topic, payload, tag, status, enqueued_ts) \
             VALUES (?1, ?2, ?3, 'queued', ?4)",
            params![topic, payload, tag, Utc::now().timestamp_micros()],
        )?;
        Ok(changes > 0)
    }

    /// Atomically claim the lowest-id entry that is `queued`, or
    /// `processing` with an expired visibility timeout. The claimed
    /// entry moves to `processing` with `attempts` incremented; an entry
    /// that already burned `max_attempts` is dead-lettered instead and
    /// nothing is returned for it this call.
    pub fn reserve(
        &self,
        topic: &str,
        visibility_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Option<Reserved>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now().timestamp_micros();
        let cutoff = now - visibility_timeout.as_micros() as i64;

        let row: Option<(i64, String, String, u32)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, payload, tag, attempts FROM queue \
                 WHERE topic = ?1 \
                   AND (status = 'queued' \
                        OR (status = 'processing' \
                            AND (dequeued_ts IS NULL OR dequeued_ts <= ?2))) \
                 ORDER BY id ASC LIMIT 1",
            )?;
            stmt.query_row(params![topic, cutoff], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?
        };

        let Some((id, payload, tag, attempts)) = row else {
            tx.commit()?;
            return Ok(None);
        };

        if attempts >= max_attempts {
            tx.execute("UPDATE queue SET status = 'dead' WHERE id = ?1", [id])?;
            tx.commit()?;
            return Ok(None);
        }

        tx.execute(
            "UPDATE queue SET status = 'processing', attempts = attempts + 1, \
             dequeued_ts = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.commit()?;

        Ok(Some(Reserved { id, tag, payload }))
    }

    /// Mark done. Absorbing: a done entry is never redelivered.
    pub fn ack(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE queue SET status = 'done' WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Return to `queued` for retry, or dead-letter when `dead`.
    pub fn nack(&self, id: i64, dead: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE queue SET status = ?1 WHERE id = ?2",
            params![if dead { "dead" } else { "queued" }, id],
        )?;
        Ok(())
    }

    /// Live entries (queued or processing) in a topic.
    pub fn depth(&self, topic: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE topic = ?1 AND status IN ('queued','processing')",
            [topic],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Test hook simulating a lost ack: force an entry back to `queued`
    /// regardless of its current status.
    #[cfg(test)]
    pub fn reset_to_queued(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE queue SET status = 'queued' WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn dead_letter_count(&self, topic: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE topic = ?1 AND status = 'dead'",
            [topic],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIS: Duration = Duration::from_secs(10);

    #[test]
    fn test_enqueue_idempotent_by_topic_tag() {
        let q = IntentQueue::in_memory().unwrap();
        assert!(q.enqueue("t", "T1", r#"{"a":1}"#).unwrap());
        assert!(!q.enqueue("t", "T1", r#"{"a":2}"#).unwrap());
        assert_eq!(q.depth("t").unwrap(), 1);

        let got = q.reserve("t", VIS, 10).unwrap().unwrap();
        assert_eq!(got.tag, "T1");
        assert_eq!(got.payload, r#"{"a":1}"#);

        // Reserved entry is invisible until the timeout expires.
        assert!(q.reserve("t", VIS, 10).unwrap().is_none());
    }

    #[test]
    fn test_fifo_by_insertion_id() {
        let q = IntentQueue::in_memory().unwrap();
        q.enqueue("t", "A", "1").unwrap();
        q.enqueue("t", "B", "2").unwrap();
        assert_eq!(q.reserve("t", VIS, 10).unwrap().unwrap().tag, "A");
        assert_eq!(q.reserve("t", VIS, 10).unwrap().unwrap().tag, "B");
    }

    #[test]
    fn test_ack_is_absorbing() {
        let q = IntentQueue::in_memory().unwrap();
        q.enqueue("t", "A", "1").unwrap();
        let r = q.reserve("t", VIS, 10).unwrap().unwrap();
        q.ack(r.id).unwrap();
        assert_eq!(q.depth("t").unwrap(), 0);
        // Even with an expired visibility window, done is never redelivered.
        assert!(q.reserve("t", Duration::ZERO, 10).unwrap().is_none());
    }

    #[test]
    fn test_nack_requeues_and_nack_dead_buries() {
        let q = IntentQueue::in_memory().unwrap();
        q.enqueue("t", "A", "1").unwrap();

        let r = q.reserve("t", VIS, 10).unwrap().unwrap();
        q.nack(r.id, false).unwrap();
        let r2 = q.reserve("t", VIS, 10).unwrap().unwrap();
        assert_eq!(r2.tag, "A");

        q.nack(r2.id, true).unwrap();
        assert!(q.reserve("t", Duration::ZERO, 10).unwrap().is_none());
        assert_eq!(q.dead_letter_count("t").unwrap(), 1);
        assert_eq!(q.depth("t").unwrap(), 0);
    }

    #[test]
    fn test_visibility_timeout_recovers_crashed_consumer() {
        let q = IntentQueue::in_memory().unwrap();
        q.enqueue("t", "A", "1").unwrap();

        // Consumer reserves, then "crashes" without ack.
        let first = q.reserve("t", VIS, 10).unwrap().unwrap();
        assert!(q.reserve("t", VIS, 10).unwrap().is_none());

        // With a zero timeout the entry is immediately eligible again.
        let redelivered = q.reserve("t", Duration::ZERO, 10).unwrap().unwrap();
        assert_eq!(redelivered.id, first.id);
        assert_eq!(redelivered.tag, "A");
    }

    #[test]
    fn test_max_attempts_dead_letters() {
        let q = IntentQueue::in_memory().unwrap();
        q.enqueue("t", "A", "1").unwrap();

        // Two delivery attempts permitted; the third probe buries it.
        for _ in 0..2 {
            let r = q.reserve("t", Duration::ZERO, 2).unwrap().unwrap();
            q.nack(r.id, false).unwrap();
        }
        assert!(q.reserve("t", Duration::ZERO, 2).unwrap().is_none());
        assert_eq!(q.dead_letter_count("t").unwrap(), 1);
    }

    #[test]
    fn test_topics_are_isolated() {
        let q = IntentQueue::in_memory().unwrap();
        q.enqueue("a", "T", "1").unwrap();
        q.enqueue("b", "T", "2").unwrap();
        assert_eq!(q.depth("a").unwrap(), 1);
        assert_eq!(q.reserve("b", VIS, 10).unwrap().unwrap().payload, "2");
        assert_eq!(q.depth("a").unwrap(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.db");
        {
            let q = IntentQueue::open(&path).unwrap();
            q.enqueue("t", "A", "1").unwrap();
        }
        let q = IntentQueue::open(&path).unwrap();
        assert_eq!(q.depth("t").unwrap(), 1);
        assert_eq!(q.reserve("t", VIS, 10).unwrap().unwrap().tag, "A");
    }
}
