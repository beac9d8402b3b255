//! execd — execution daemon.
//!
//! Reserves intents from the durable queue and drives each through the
//! broker port with a tracked order lifecycle, appending every event to
//! the day's ledger. `EXEC_ENV=paper` runs against the in-process paper
//! broker; `live` requires a venue adapter this build does not link, so
//! it fails fast.

use anyhow::{bail, Result};
use clap::Parser;
use dotenv::dotenv;
use tapeline::broker::paper::PaperBroker;
use tapeline::broker::Broker;
use tapeline::execution::worker::{ack_window, ExecWorker, ExecWorkerConfig, INTENT_TOPIC};
use tapeline::ops;
use tapeline::paths::DataRoot;
use tapeline::queue::IntentQueue;
use tapeline::risk::RiskConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "execd")]
#[command(about = "Reserve intents, place via broker, record order lifecycle")]
struct Args {
    #[arg(long, env = "DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    /// Comma-separated tradable symbols.
    #[arg(long, default_value = "SPY", value_delimiter = ',')]
    symbols: Vec<String>,

    #[arg(long, env = "EXEC_ENV", default_value = "paper")]
    exec_env: String,

    /// Observed broker ack p95, widens the ack wait window.
    #[arg(long, env = "ACK_P95_MS")]
    ack_p95_ms: Option<u64>,

    #[arg(long, default_value_t = 0.25)]
    poll_sec: f64,

    /// Cancel an order that has no terminal state after this long.
    #[arg(long, default_value_t = 30)]
    ttl_sec: u64,

    #[arg(long, default_value_t = 10)]
    visibility_timeout_sec: u64,

    #[arg(long, default_value_t = 10)]
    max_attempts: u32,

    #[arg(long, default_value_t = 2000.0)]
    max_notional: f64,

    #[arg(long, default_value_t = 150.0)]
    price_band_bps: f64,

    /// Paper broker simulated fill latency.
    #[arg(long, default_value_t = 150)]
    paper_fill_ms: u64,
}

fn build_broker(args: &Args) -> Result<Arc<dyn Broker>> {
    match args.exec_env.as_str() {
        "paper" => Ok(Arc::new(PaperBroker::new(Duration::from_millis(
            args.paper_fill_ms,
        )))),
        "live" => {
            bail!("EXEC_ENV=live requires a venue adapter (IBKR/Alpaca) not linked in this build")
        }
        other => bail!("unknown EXEC_ENV {other:?}, expected paper or live"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    ops::init_tracing("execd");
    let args = Args::parse();

    let root = DataRoot::new(&args.data_root);
    let queue = IntentQueue::open(root.queue_path())?;
    let broker = build_broker(&args)?;
    let risk = RiskConfig::new(
        args.max_notional,
        args.price_band_bps,
        args.symbols.iter().cloned(),
        root.killswitch_path(),
    );

    let cfg = ExecWorkerConfig {
        visibility_timeout: Duration::from_secs(args.visibility_timeout_sec),
        max_attempts: args.max_attempts,
        ack_window: ack_window(args.ack_p95_ms),
        order_ttl: Duration::from_secs(args.ttl_sec),
    };
    info!(
        env = %args.exec_env,
        ack_window_ms = cfg.ack_window.as_millis() as u64,
        ttl_sec = args.ttl_sec,
        "execd starting"
    );

    let worker = ExecWorker::new(queue.clone(), root.clone(), risk, broker, cfg);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        // run_once is never selected against the stop signal: an
        // in-flight place→ack must complete (or time out) before exit,
        // so the signal only interrupts idle waits.
        ops::beat(&root.heartbeat_path("execd"))?;
        let idle = match worker.run_once().await {
            Ok(true) => Duration::ZERO,
            Ok(false) => Duration::from_secs_f64(args.poll_sec),
            Err(e) => {
                warn!("worker error: {e:#}");
                Duration::from_secs(1)
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("stop signal received");
                break;
            }
            _ = tokio::time::sleep(idle) => {}
        }
    }

    info!(
        depth = queue.depth(INTENT_TOPIC).unwrap_or(-1),
        dead = queue.dead_letter_count(INTENT_TOPIC).unwrap_or(-1),
        "execd stopped"
    );
    Ok(())
}
