//! Append-only execution ledger.
//!
//! One parquet file per day with nullable per-kind columns. Appends hold
//! the advisory lock for the whole read-concat-swap cycle so concurrent
//! daemons (execd lifecycle rows, engined shadow rows) never lose rows.
//! Entries are never mutated; consumers order by `event_ts` when present,
//! else `ts`.

use crate::models::Side;
use crate::storage::atomic::FileLock;
use crate::storage::tables::{col, opt_col, read_batches, write_batch};
use anyhow::{bail, Result};
use arrow::array::{
    Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerKind {
    Intent,
    IntentShadow,
    Ack,
    Rej,
    Partial,
    Fill,
    Cancel,
    PnlSnapshot,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Intent => "INTENT",
            LedgerKind::IntentShadow => "INTENT_SHADOW",
            LedgerKind::Ack => "ACK",
            LedgerKind::Rej => "REJ",
            LedgerKind::Partial => "PARTIAL",
            LedgerKind::Fill => "FILL",
            LedgerKind::Cancel => "CANCEL",
            LedgerKind::PnlSnapshot => "PNL_SNAPSHOT",
        }
    }

    pub fn parse(s: &str) -> Option<LedgerKind> {
        match s {
            "INTENT" => Some(LedgerKind::Intent),
            "INTENT_SHADOW" => Some(LedgerKind::IntentShadow),
            "ACK" => Some(LedgerKind::Ack),
            "REJ" => Some(LedgerKind::Rej),
            "PARTIAL" => Some(LedgerKind::Partial),
            "FILL" => Some(LedgerKind::Fill),
            "CANCEL" => Some(LedgerKind::Cancel),
            "PNL_SNAPSHOT" => Some(LedgerKind::PnlSnapshot),
            _ => None,
        }
    }

    /// Kinds that carry an incremental fill (`fill_qty` + cumulative
    /// `avg_px`). A multi-slice order records its intermediate slices as
    /// PARTIAL and the terminal slice as FILL; accounting consumes both.
    pub fn is_fill_event(&self) -> bool {
        matches!(self, LedgerKind::Partial | LedgerKind::Fill)
    }
}

/// One ledger row. `ts` is the intent time; `event_ts` is when the event
/// was observed (broker or local clock).
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub ts: DateTime<Utc>,
    pub event_ts: Option<DateTime<Utc>>,
    pub kind: LedgerKind,
    pub tag: String,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub qty: Option<f64>,
    pub limit: Option<f64>,
    pub fill_qty: Option<f64>,
    pub avg_px: Option<f64>,
    pub reason: Option<String>,
    pub shortfall_bps: Option<f64>,
}

impl LedgerRecord {
    pub fn new(kind: LedgerKind, tag: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            event_ts: None,
            kind,
            tag: tag.into(),
            symbol: None,
            side: None,
            qty: None,
            limit: None,
            fill_qty: None,
            avg_px: None,
            reason: None,
            shortfall_bps: None,
        }
    }

    /// Ordering timestamp: `event_ts` when present, else `ts`.
    pub fn order_ts(&self) -> DateTime<Utc> {
        self.event_ts.unwrap_or(self.ts)
    }

    fn required_ok(&self) -> bool {
        match self.kind {
            LedgerKind::Intent | LedgerKind::IntentShadow => {
                self.symbol.is_some() && self.side.is_some() && self.qty.is_some()
            }
            LedgerKind::Partial | LedgerKind::Fill => {
                self.fill_qty.is_some() && self.avg_px.is_some()
            }
            LedgerKind::Rej => self.reason.is_some(),
            LedgerKind::PnlSnapshot => self.shortfall_bps.is_some(),
            LedgerKind::Ack | LedgerKind::Cancel => true,
        }
    }
}

fn ledger_schema() -> Arc<Schema> {
    let ts_type = DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    Arc::new(Schema::new(vec![
        Field::new("ts", ts_type.clone(), false),
        Field::new("event_ts", ts_type, true),
        Field::new("kind", DataType::Utf8, false),
        Field::new("tag", DataType::Utf8, false),
        Field::new("symbol", DataType::Utf8, true),
        Field::new("side", DataType::Utf8, true),
        Field::new("qty", DataType::Float64, true),
        Field::new("limit", DataType::Float64, true),
        Field::new("fill_qty", DataType::Float64, true),
        Field::new("avg_px", DataType::Float64, true),
        Field::new("reason", DataType::Utf8, true),
        Field::new("shortfall_bps", DataType::Float64, true),
    ]))
}

fn ledger_batch(rows: &[LedgerRecord]) -> Result<RecordBatch> {
    let schema = ledger_schema();
    let ts: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| r.ts.timestamp_micros())
        .collect::<Vec<_>>()
        .into();
    let event_ts: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| r.event_ts.map(|v| v.timestamp_micros()))
        .collect::<Vec<_>>()
        .into();
    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ts.with_timezone("UTC")) as ArrayRef,
            Arc::new(event_ts.with_timezone("UTC")),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.tag.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(
                rows.iter()
                    .map(|r| r.symbol.as_deref())
                    .collect::<StringArray>(),
            ),
            Arc::new(
                rows.iter()
                    .map(|r| r.side.map(|s| s.as_str()))
                    .collect::<StringArray>(),
            ),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.qty).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.limit).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.fill_qty).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.avg_px).collect::<Vec<_>>(),
            )),
            Arc::new(
                rows.iter()
                    .map(|r| r.reason.as_deref())
                    .collect::<StringArray>(),
            ),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.shortfall_bps).collect::<Vec<_>>(),
            )),
        ],
    )?)
}

/// Append rows to the day's ledger under the advisory lock.
///
/// An existing-but-unreadable file degrades to a new-only write so
/// progress is preserved; the unreadable content is not destroyed until
/// the swap, and the condition is logged.
pub fn append_ledger(path: &Path, rows: &[LedgerRecord]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    for r in rows {
        if !r.required_ok() {
            bail!("ledger row {:?} missing required columns for {}", r.tag, r.kind.as_str());
        }
    }
    let _lock = FileLock::acquire(path)?;
    let mut all = match read_ledger(path) {
        Ok(existing) => existing,
        Err(e) => {
            warn!("unreadable ledger {}: {e:#}; continuing new-only", path.display());
            Vec::new()
        }
    };
    all.extend(rows.iter().cloned());
    write_batch(path, ledger_schema(), ledger_batch(&all)?)
}

/// Read the full ledger in append order. Rows with an unknown kind or a
/// missing tag are skipped with a warning rather than poisoning the read.
pub fn read_ledger(path: &Path) -> Result<Vec<LedgerRecord>> {
    let mut out = Vec::new();
    for batch in read_batches(path)? {
        let ts = col::<TimestampMicrosecondArray>(&batch, "ts")?;
        let kind = col::<StringArray>(&batch, "kind")?;
        let tag = col::<StringArray>(&batch, "tag")?;
        let event_ts = opt_col::<TimestampMicrosecondArray>(&batch, "event_ts");
        let symbol = opt_col::<StringArray>(&batch, "symbol");
        let side = opt_col::<StringArray>(&batch, "side");
        let qty = opt_col::<Float64Array>(&batch, "qty");
        let limit = opt_col::<Float64Array>(&batch, "limit");
        let fill_qty = opt_col::<Float64Array>(&batch, "fill_qty");
        let avg_px = opt_col::<Float64Array>(&batch, "avg_px");
        let reason = opt_col::<StringArray>(&batch, "reason");
        let shortfall = opt_col::<Float64Array>(&batch, "shortfall_bps");

        let get_f64 = |a: Option<&Float64Array>, i: usize| {
            a.filter(|c| !c.is_null(i)).map(|c| c.value(i))
        };
        let get_str = |a: Option<&StringArray>, i: usize| {
            a.filter(|c| !c.is_null(i)).map(|c| c.value(i).to_string())
        };

        for i in 0..batch.num_rows() {
            let Some(k) = LedgerKind::parse(kind.value(i)) else {
                warn!("skipping ledger row with unknown kind {}", kind.value(i));
                continue;
            };
            out.push(LedgerRecord {
                ts: DateTime::from_timestamp_micros(ts.value(i)).unwrap_or_default(),
                event_ts: event_ts
                    .filter(|c| !c.is_null(i))
                    .map(|c| DateTime::from_timestamp_micros(c.value(i)).unwrap_or_default()),
                kind: k,
                tag: tag.value(i).to_string(),
                symbol: get_str(symbol, i),
                side: get_str(side, i).and_then(|s| Side::parse(&s)),
                qty: get_f64(qty, i),
                limit: get_f64(limit, i),
                fill_qty: get_f64(fill_qty, i),
                avg_px: get_f64(avg_px, i),
                reason: get_str(reason, i),
                shortfall_bps: get_f64(shortfall, i),
            });
        }
    }
    Ok(out)
}

/// Idempotency probe: has any row for `tag` been committed?
pub fn ledger_has_tag(path: &Path, tag: &str) -> Result<bool> {
    Ok(read_ledger(path)?.iter().any(|r| r.tag == tag))
}
