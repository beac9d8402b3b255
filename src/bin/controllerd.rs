//! controllerd — parameter application daemon.
//!
//! Every interval, evaluates the feed-health, drawdown, and
//! acceptance-rate guards, then applies the most recent proposal to the
//! runtime params under clamps and a per-step delta cap. The only
//! writer of `params/runtime_{SYM}.json`.

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tapeline::controller::{controller_step, ControllerConfig, Decision};
use tapeline::ops;
use tapeline::params::RuntimeParams;
use tapeline::paths::DataRoot;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "controllerd")]
#[command(about = "Apply advisor proposals to runtime params under guards")]
struct Args {
    #[arg(long, default_value = "SPY")]
    symbol: String,

    #[arg(long, env = "DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    #[arg(long, env = "EQUITY_USD", default_value_t = 30000.0)]
    equity_usd: f64,

    #[arg(long, default_value_t = 5.0)]
    interval_sec: f64,

    #[arg(long, default_value_t = 0.2)]
    delta_cap_bps: f64,

    #[arg(long, default_value_t = 0.3)]
    min_bps: f64,

    #[arg(long, default_value_t = 3.0)]
    max_bps: f64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    ops::init_tracing("controllerd");
    let args = Args::parse();

    let root = DataRoot::new(&args.data_root);
    let mut cfg = ControllerConfig::new(&args.symbol, args.equity_usd);
    cfg.delta_cap_bps = args.delta_cap_bps;
    cfg.min_bps = args.min_bps;
    cfg.max_bps = args.max_bps;

    let mut params =
        RuntimeParams::load_or_init(&root.runtime_params_path(&args.symbol), &args.symbol)?;
    info!(
        symbol = %args.symbol,
        threshold_bps = params.signal_threshold_bps,
        equity_usd = args.equity_usd,
        "controllerd starting"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("stop signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(args.interval_sec)) => {
                ops::beat(&root.heartbeat_path("controllerd"))?;
                match controller_step(&root, &cfg, &mut params, chrono::Utc::now()) {
                    Ok(Decision::Apply { threshold_bps, delta_bps }) => {
                        info!(threshold_bps, delta_bps, "params updated");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("controller step failed: {e:#}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    info!("controllerd stopped");
    Ok(())
}
