//! feedd — trade ingest daemon.
//!
//! Streams prints from a trade source, tags ingest time on receipt,
//! aggregates the day's tape into 1s bars, and persists both tables
//! each flush. Sole writer of `live/{day}/trades_*` and `bars1s_*`.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use tapeline::feed::replay::ReplayTrades;
use tapeline::feed::synthetic::SyntheticTrades;
use tapeline::feed::TradeSource;
use tapeline::ingest::aggregator::aggregate_trades_to_1s_bars;
use tapeline::ingest::clock::FeedClock;
use tapeline::ingest::metrics::freshness_p99_ms;
use tapeline::models::MarketTrade;
use tapeline::ops;
use tapeline::paths::DataRoot;
use tapeline::storage::tables::{read_trades, write_bars, write_trades};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    Synthetic,
    Replay,
}

#[derive(Parser, Debug)]
#[command(name = "feedd")]
#[command(about = "Stream trades, aggregate 1s bars, persist both per day")]
struct Args {
    #[arg(long, default_value = "SPY")]
    symbol: String,

    #[arg(long, env = "DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    #[arg(long, value_enum, default_value_t = SourceKind::Synthetic)]
    source: SourceKind,

    /// Recorded trades table for --source replay.
    #[arg(long)]
    replay_path: Option<PathBuf>,

    /// Replay speed multiplier (1.0 = original pacing).
    #[arg(long, default_value_t = 1.0)]
    replay_speed: f64,

    /// Synthetic tape starting price.
    #[arg(long, default_value_t = 500.0)]
    start_px: f64,

    /// Seconds between table flushes.
    #[arg(long, default_value_t = 1.0)]
    flush_sec: f64,
}

fn build_source(args: &Args) -> Result<Box<dyn TradeSource>> {
    match args.source {
        SourceKind::Synthetic => Ok(Box::new(SyntheticTrades::new(
            &args.symbol,
            args.start_px,
            Duration::from_millis(250),
        ))),
        SourceKind::Replay => {
            let path = args
                .replay_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("--replay-path is required with --source replay"))?;
            Ok(Box::new(ReplayTrades::open(path, args.replay_speed)?))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    ops::init_tracing("feedd");
    let args = Args::parse();

    let root = DataRoot::new(&args.data_root);
    let mut source = build_source(&args)?;
    let mut clock = FeedClock::new();

    // Seed the day buffer from an earlier run so a restart re-aggregates
    // the full day instead of clobbering it.
    let mut day = chrono::Utc::now().date_naive();
    let mut buf: Vec<MarketTrade> =
        read_trades(&root.trades_path(day, &args.symbol)).unwrap_or_else(|e| {
            warn!("could not seed from existing trades table: {e:#}");
            Vec::new()
        });
    if !buf.is_empty() {
        info!(trades = buf.len(), "seeded day buffer from existing table");
    }

    info!(symbol = %args.symbol, root = %root.root().display(), "feedd starting");

    let mut flush_tick = tokio::time::interval(Duration::from_secs_f64(args.flush_sec));
    let mut dirty = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("stop signal received");
                break;
            }
            _ = flush_tick.tick() => {
                ops::beat(&root.heartbeat_path("feedd"))?;

                let today = chrono::Utc::now().date_naive();
                if today != day {
                    // Close out the previous day before starting fresh.
                    if dirty {
                        if let Err(e) = flush(&root, day, &args.symbol, &buf, clock.watermark()) {
                            warn!("closing flush for {day} failed: {e:#}");
                        }
                    }
                    info!(%day, %today, "day rollover");
                    day = today;
                    buf.clear();
                    dirty = false;
                }

                if dirty {
                    if let Err(e) = flush(&root, day, &args.symbol, &buf, clock.watermark()) {
                        warn!("flush failed: {e:#}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    } else {
                        dirty = false;
                    }
                }
            }
            trade = source.next_trade() => {
                match trade {
                    Ok(Some(mut t)) => {
                        t.ingest_ts = Some(chrono::Utc::now());
                        clock.tick_from_feed(t.ts);
                        buf.push(t);
                        dirty = true;
                    }
                    Ok(None) => {
                        info!("trade source exhausted");
                        break;
                    }
                    Err(e) => {
                        warn!("trade source error: {e:#}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    // Final flush so a clean stop loses nothing.
    if dirty {
        flush(&root, day, &args.symbol, &buf, clock.watermark())?;
    }
    info!("feedd stopped");
    Ok(())
}

fn flush(
    root: &DataRoot,
    day: chrono::NaiveDate,
    symbol: &str,
    buf: &[MarketTrade],
    watermark: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    write_trades(&root.trades_path(day, symbol), buf)?;
    let bars = aggregate_trades_to_1s_bars(buf, symbol);
    write_bars(&root.bars_path(day, symbol), &bars)?;
    debug!(
        trades = buf.len(),
        bars = bars.len(),
        watermark = ?watermark,
        freshness_p99_ms = freshness_p99_ms(buf),
        "flushed day tables"
    );
    Ok(())
}
