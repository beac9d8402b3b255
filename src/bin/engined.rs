//! engined — decision daemon.
//!
//! Tails the current day's bars table, runs the strategy under the risk
//! gate with hot-reloaded runtime params, enqueues accepted intents with
//! deterministic tags, and mirrors each one into the shadow ledger for
//! coverage tracking.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use dotenv::dotenv;
use tapeline::engine::DecisionEngine;
use tapeline::execution::worker::INTENT_TOPIC;
use tapeline::ops;
use tapeline::params::RuntimeParams;
use tapeline::paths::DataRoot;
use tapeline::queue::IntentQueue;
use tapeline::risk::RiskConfig;
use tapeline::storage::ledger::{append_ledger, LedgerKind, LedgerRecord};
use tapeline::storage::tables::read_bars;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "engined")]
#[command(about = "Tail bars, evaluate strategy under risk gate, enqueue intents")]
struct Args {
    #[arg(long, default_value = "SPY")]
    symbol: String,

    #[arg(long, env = "DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    #[arg(long, default_value_t = 1.0)]
    poll_sec: f64,

    #[arg(long, default_value_t = 2000.0)]
    max_notional: f64,

    #[arg(long, default_value_t = 150.0)]
    price_band_bps: f64,

    /// Strategy rolling window (seconds of closes).
    #[arg(long, default_value_t = 30)]
    window: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    ops::init_tracing("engined");
    let args = Args::parse();

    let root = DataRoot::new(&args.data_root);
    let queue = IntentQueue::open(root.queue_path())?;
    let params_path = root.runtime_params_path(&args.symbol);
    let params = RuntimeParams::load_or_init(&params_path, &args.symbol)?;

    let risk = RiskConfig::new(
        args.max_notional,
        args.price_band_bps,
        [args.symbol.clone()],
        root.killswitch_path(),
    );
    let mut engine = DecisionEngine::new(
        &args.symbol,
        risk,
        params_path,
        params.signal_threshold_bps,
        args.window,
    );

    info!(symbol = %args.symbol, threshold_bps = params.signal_threshold_bps, "engined starting");

    let mut last_ts: Option<DateTime<Utc>> = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("stop signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(args.poll_sec)) => {
                ops::beat(&root.heartbeat_path("engined"))?;
                if let Err(e) = poll_once(&root, &args, &queue, &mut engine, &mut last_ts) {
                    warn!("engine loop error: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    info!("engined stopped");
    Ok(())
}

fn poll_once(
    root: &DataRoot,
    args: &Args,
    queue: &IntentQueue,
    engine: &mut DecisionEngine,
    last_ts: &mut Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(day) = root.latest_live_day() else {
        return Ok(());
    };
    let bars = read_bars(&root.bars_path(day, &args.symbol))?;

    for bar in bars {
        if last_ts.is_some_and(|t| bar.ts <= t) {
            continue;
        }

        for order in engine.on_bar(&bar) {
            let tag = order.effective_tag();
            let payload = serde_json::to_string(&order)?;
            let fresh = queue.enqueue(INTENT_TOPIC, &tag, &payload)?;
            if !fresh {
                continue;
            }

            let now = Utc::now();
            let mut shadow = LedgerRecord::new(LedgerKind::IntentShadow, &tag, order.ts);
            shadow.event_ts = Some(now);
            shadow.symbol = Some(order.symbol.clone());
            shadow.side = Some(order.side);
            shadow.qty = Some(order.qty);
            shadow.limit = order.limit;
            append_ledger(&root.shadow_ledger_path(now.date_naive()), &[shadow])?;

            info!(%tag, side = %order.side, qty = order.qty, "intent enqueued");
        }

        *last_ts = Some(bar.ts);
    }

    Ok(())
}
