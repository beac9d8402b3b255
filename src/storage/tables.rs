//! Typed parquet tables for the day-partitioned artifacts.
//!
//! One concrete reader/writer pair per table. All timestamps are stored
//! as Timestamp(Microsecond, UTC); floats are Float64, sizes/volumes
//! Int64. Full-table writes stage to a temp file and swap in atomically;
//! row appends additionally hold the table's advisory lock across the
//! read-concat-swap cycle.

use crate::models::{Bar1s, MarketTrade};
use crate::storage::atomic::{staging_path, swap_into_place, FileLock};
use anyhow::{anyhow, Context, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

fn ts_field(name: &str, nullable: bool) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        nullable,
    )
}

fn dt_from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

/// Read all record batches from a parquet file. Missing file reads as
/// empty; an unreadable file is an error the caller decides about.
pub(crate) fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("parquet reader {}", path.display()))?
        .build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.with_context(|| format!("read batch {}", path.display()))?);
    }
    Ok(batches)
}

pub(crate) fn write_batch(path: &Path, schema: Arc<Schema>, batch: RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let staged = staging_path(path);
    let file =
        File::create(&staged).with_context(|| format!("create {}", staged.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)
        .with_context(|| format!("parquet writer {}", staged.display()))?;
    if batch.num_rows() > 0 {
        writer.write(&batch)?;
    }
    writer.close()?;
    swap_into_place(&staged, path)
}

pub(crate) fn col<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("column {name} has unexpected type"))
}

pub(crate) fn opt_col<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Option<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

fn trades_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field("ts", false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
        Field::new("size", DataType::Int64, false),
        Field::new("venue", DataType::Utf8, true),
        Field::new("source", DataType::Utf8, true),
        ts_field("ingest_ts", true),
    ]))
}

/// Overwrite the day's trade table. feedd is the sole writer, so a full
/// rewrite per flush keeps every bucket written at most once per flush.
pub fn write_trades(path: &Path, trades: &[MarketTrade]) -> Result<()> {
    let schema = trades_schema();
    let ts: TimestampMicrosecondArray = trades
        .iter()
        .map(|t| t.ts.timestamp_micros())
        .collect::<Vec<_>>()
        .into();
    let ingest: TimestampMicrosecondArray = trades
        .iter()
        .map(|t| t.ingest_ts.map(|v| v.timestamp_micros()))
        .collect::<Vec<_>>()
        .into();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(ts.with_timezone("UTC")) as ArrayRef,
            Arc::new(StringArray::from(
                trades.iter().map(|t| t.symbol.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                trades.iter().map(|t| t.price).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                trades.iter().map(|t| t.size).collect::<Vec<_>>(),
            )),
            Arc::new(
                trades
                    .iter()
                    .map(|t| t.venue.as_deref())
                    .collect::<StringArray>(),
            ),
            Arc::new(
                trades
                    .iter()
                    .map(|t| t.source.as_deref())
                    .collect::<StringArray>(),
            ),
            Arc::new(ingest.with_timezone("UTC")),
        ],
    )?;
    write_batch(path, schema, batch)
}

pub fn read_trades(path: &Path) -> Result<Vec<MarketTrade>> {
    let mut out = Vec::new();
    for batch in read_batches(path)? {
        let ts = col::<TimestampMicrosecondArray>(&batch, "ts")?;
        let symbol = col::<StringArray>(&batch, "symbol")?;
        let price = col::<Float64Array>(&batch, "price")?;
        let size = col::<Int64Array>(&batch, "size")?;
        let venue = opt_col::<StringArray>(&batch, "venue");
        let source = opt_col::<StringArray>(&batch, "source");
        let ingest = opt_col::<TimestampMicrosecondArray>(&batch, "ingest_ts");
        for i in 0..batch.num_rows() {
            out.push(MarketTrade {
                ts: dt_from_micros(ts.value(i)),
                symbol: symbol.value(i).to_string(),
                price: price.value(i),
                size: size.value(i),
                venue: venue
                    .filter(|a| !a.is_null(i))
                    .map(|a| a.value(i).to_string()),
                source: source
                    .filter(|a| !a.is_null(i))
                    .map(|a| a.value(i).to_string()),
                ingest_ts: ingest
                    .filter(|a| !a.is_null(i))
                    .map(|a| dt_from_micros(a.value(i))),
            });
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------------

fn bars_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field("ts", false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Int64, false),
    ]))
}

pub fn write_bars(path: &Path, bars: &[Bar1s]) -> Result<()> {
    let schema = bars_schema();
    let ts: TimestampMicrosecondArray = bars
        .iter()
        .map(|b| b.ts.timestamp_micros())
        .collect::<Vec<_>>()
        .into();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(ts.with_timezone("UTC")) as ArrayRef,
            Arc::new(StringArray::from(
                bars.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                bars.iter().map(|b| b.open).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                bars.iter().map(|b| b.high).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                bars.iter().map(|b| b.low).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                bars.iter().map(|b| b.close).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                bars.iter().map(|b| b.volume).collect::<Vec<_>>(),
            )),
        ],
    )?;
    write_batch(path, schema, batch)
}

/// Read a bars table sorted ascending by `ts`.
pub fn read_bars(path: &Path) -> Result<Vec<Bar1s>> {
    let mut out = Vec::new();
    for batch in read_batches(path)? {
        let ts = col::<TimestampMicrosecondArray>(&batch, "ts")?;
        let symbol = col::<StringArray>(&batch, "symbol")?;
        let open = col::<Float64Array>(&batch, "open")?;
        let high = col::<Float64Array>(&batch, "high")?;
        let low = col::<Float64Array>(&batch, "low")?;
        let close = col::<Float64Array>(&batch, "close")?;
        let volume = col::<Int64Array>(&batch, "volume")?;
        for i in 0..batch.num_rows() {
            out.push(Bar1s {
                ts: dt_from_micros(ts.value(i)),
                symbol: symbol.value(i).to_string(),
                open: open.value(i),
                high: high.value(i),
                low: low.value(i),
                close: close.value(i),
                volume: volume.value(i),
            });
        }
    }
    out.sort_by_key(|b| b.ts);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Advisor proposals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRow {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub threshold_bps: f64,
    pub risk_multiplier: f64,
    pub notes: String,
    pub provider: String,
    pub cost_usd: f64,
}

fn proposals_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field("ts", false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("threshold_bps", DataType::Float64, false),
        Field::new("risk_multiplier", DataType::Float64, false),
        Field::new("notes", DataType::Utf8, false),
        Field::new("provider", DataType::Utf8, false),
        Field::new("cost_usd", DataType::Float64, false),
    ]))
}

fn proposals_batch(rows: &[ProposalRow]) -> Result<RecordBatch> {
    let schema = proposals_schema();
    let ts: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| r.ts.timestamp_micros())
        .collect::<Vec<_>>()
        .into();
    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ts.with_timezone("UTC")) as ArrayRef,
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.threshold_bps).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.risk_multiplier).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.notes.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.provider.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.cost_usd).collect::<Vec<_>>(),
            )),
        ],
    )?)
}

pub fn read_proposals(path: &Path) -> Result<Vec<ProposalRow>> {
    let mut out = Vec::new();
    for batch in read_batches(path)? {
        let ts = col::<TimestampMicrosecondArray>(&batch, "ts")?;
        let symbol = col::<StringArray>(&batch, "symbol")?;
        let threshold = col::<Float64Array>(&batch, "threshold_bps")?;
        let risk_mult = col::<Float64Array>(&batch, "risk_multiplier")?;
        let notes = col::<StringArray>(&batch, "notes")?;
        let provider = col::<StringArray>(&batch, "provider")?;
        let cost = col::<Float64Array>(&batch, "cost_usd")?;
        for i in 0..batch.num_rows() {
            out.push(ProposalRow {
                ts: dt_from_micros(ts.value(i)),
                symbol: symbol.value(i).to_string(),
                threshold_bps: threshold.value(i),
                risk_multiplier: risk_mult.value(i),
                notes: notes.value(i).to_string(),
                provider: provider.value(i).to_string(),
                cost_usd: cost.value(i),
            });
        }
    }
    out.sort_by_key(|r| r.ts);
    Ok(out)
}

pub fn append_proposal(path: &Path, row: &ProposalRow) -> Result<()> {
    let _lock = FileLock::acquire(path)?;
    let mut rows = read_proposals(path).unwrap_or_else(|e| {
        tracing::warn!("unreadable proposals table {}: {e:#}", path.display());
        Vec::new()
    });
    rows.push(row.clone());
    write_batch(path, proposals_schema(), proposals_batch(&rows)?)
}

// ---------------------------------------------------------------------------
// Controller applied decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRow {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub accepted_threshold_bps: f64,
    pub delta_bps: f64,
    pub seen: i64,
    pub freeze: bool,
}

fn applied_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ts_field("ts", false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("accepted_threshold_bps", DataType::Float64, false),
        Field::new("delta_bps", DataType::Float64, false),
        Field::new("seen", DataType::Int64, false),
        Field::new("freeze", DataType::Boolean, false),
    ]))
}

fn applied_batch(rows: &[AppliedRow]) -> Result<RecordBatch> {
    let schema = applied_schema();
    let ts: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| r.ts.timestamp_micros())
        .collect::<Vec<_>>()
        .into();
    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ts.with_timezone("UTC")) as ArrayRef,
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter()
                    .map(|r| r.accepted_threshold_bps)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.delta_bps).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.seen).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                rows.iter().map(|r| r.freeze).collect::<Vec<_>>(),
            )),
        ],
    )?)
}

pub fn read_applied(path: &Path) -> Result<Vec<AppliedRow>> {
    let mut out = Vec::new();
    for batch in read_batches(path)? {
        let ts = col::<TimestampMicrosecondArray>(&batch, "ts")?;
        let symbol = col::<StringArray>(&batch, "symbol")?;
        let accepted = col::<Float64Array>(&batch, "accepted_threshold_bps")?;
        let delta = col::<Float64Array>(&batch, "delta_bps")?;
        let seen = col::<Int64Array>(&batch, "seen")?;
        let freeze = col::<BooleanArray>(&batch, "freeze")?;
        for i in 0..batch.num_rows() {
            out.push(AppliedRow {
                ts: dt_from_micros(ts.value(i)),
                symbol: symbol.value(i).to_string(),
                accepted_threshold_bps: accepted.value(i),
                delta_bps: delta.value(i),
                seen: seen.value(i),
                freeze: freeze.value(i),
            });
        }
    }
    out.sort_by_key(|r| r.ts);
    Ok(out)
}

pub fn append_applied(path: &Path, row: &AppliedRow) -> Result<()> {
    let _lock = FileLock::acquire(path)?;
    let mut rows = read_applied(path).unwrap_or_else(|e| {
        tracing::warn!("unreadable applied table {}: {e:#}", path.display());
        Vec::new()
    });
    rows.push(row.clone());
    write_batch(path, applied_schema(), applied_batch(&rows)?)
}

// ---------------------------------------------------------------------------
// Positions snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub symbol: String,
    pub qty: f64,
    pub avg_cost: f64,
    pub realized_pnl: f64,
}

fn positions_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("qty", DataType::Float64, false),
        Field::new("avg_cost", DataType::Float64, false),
        Field::new("realized_pnl", DataType::Float64, false),
    ]))
}

pub fn write_positions(path: &Path, rows: &[PositionRow]) -> Result<()> {
    let schema = positions_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.qty).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.avg_cost).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.realized_pnl).collect::<Vec<_>>(),
            )),
        ],
    )?;
    write_batch(path, schema, batch)
}

pub fn read_positions(path: &Path) -> Result<Vec<PositionRow>> {
    let mut out = Vec::new();
    for batch in read_batches(path)? {
        let symbol = col::<StringArray>(&batch, "symbol")?;
        let qty = col::<Float64Array>(&batch, "qty")?;
        let avg_cost = col::<Float64Array>(&batch, "avg_cost")?;
        let realized = col::<Float64Array>(&batch, "realized_pnl")?;
        for i in 0..batch.num_rows() {
            out.push(PositionRow {
                symbol: symbol.value(i).to_string(),
                qty: qty.value(i),
                avg_cost: avg_cost.value(i),
                realized_pnl: realized.value(i),
            });
        }
    }
    Ok(out)
}

/// Last bar close at or before `ts` (the TCA arrival price).
pub fn arrival_close(bars: &[Bar1s], ts: DateTime<Utc>) -> Option<f64> {
    bars.iter()
        .rev()
        .find(|b| b.ts <= ts)
        .map(|b| b.close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 14, 30, sec).unwrap()
    }

    #[test]
    fn test_trades_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades_SPY.parquet");
        let trades = vec![
            MarketTrade {
                ts: t(0),
                symbol: "SPY".into(),
                price: 500.0,
                size: 10,
                venue: Some("IEX".into()),
                source: None,
                ingest_ts: Some(t(0) + chrono::Duration::milliseconds(120)),
            },
            MarketTrade {
                ts: t(1),
                symbol: "SPY".into(),
                price: 500.1,
                size: 5,
                venue: None,
                source: Some("synthetic".into()),
                ingest_ts: None,
            },
        ];
        write_trades(&path, &trades).unwrap();
        let back = read_trades(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].price, 500.0);
        assert_eq!(back[0].venue.as_deref(), Some("IEX"));
        assert_eq!(back[0].ingest_ts, trades[0].ingest_ts);
        assert!(back[1].venue.is_none());
        assert!(back[1].ingest_ts.is_none());
    }

    #[test]
    fn test_bars_round_trip_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bars1s_SPY.parquet");
        let mk = |sec, close| Bar1s {
            ts: t(sec),
            symbol: "SPY".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
        };
        write_bars(&path, &[mk(5, 500.5), mk(3, 500.3)]).unwrap();
        let back = read_bars(&path).unwrap();
        assert_eq!(back[0].ts, t(3));
        assert_eq!(back[1].close, 500.5);
    }

    #[test]
    fn test_read_missing_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_bars(&tmp.path().join("nope.parquet")).unwrap().is_empty());
        assert!(read_proposals(&tmp.path().join("nope.parquet"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_proposal_append_accumulates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("proposals_SPY.parquet");
        for i in 0..3 {
            append_proposal(
                &path,
                &ProposalRow {
                    ts: t(i),
                    symbol: "SPY".into(),
                    threshold_bps: 0.5 + i as f64 * 0.1,
                    risk_multiplier: 1.0,
                    notes: format!("round {i}"),
                    provider: "rules".into(),
                    cost_usd: 0.0,
                },
            )
            .unwrap();
        }
        let rows = read_proposals(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].notes, "round 2");
        assert!((rows[2].threshold_bps - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_arrival_close_picks_last_at_or_before() {
        let mk = |sec, close| Bar1s {
            ts: t(sec),
            symbol: "SPY".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
        };
        let bars = vec![mk(0, 100.0), mk(1, 101.0), mk(2, 102.0)];
        assert_eq!(arrival_close(&bars, t(1)), Some(101.0));
        assert_eq!(arrival_close(&bars, t(9)), Some(102.0));
        assert_eq!(
            arrival_close(&bars, t(0) - chrono::Duration::seconds(1)),
            None
        );
    }
}
