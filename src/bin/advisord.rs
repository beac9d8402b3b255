//! advisord — parameter proposal daemon.
//!
//! Every interval, computes features over the trailing window of bars
//! and appends the provider's proposal to the per-day proposals table.
//! It never trades and never touches runtime params; the controller
//! decides what, if anything, to apply.

use anyhow::{bail, Result};
use clap::Parser;
use dotenv::dotenv;
use tapeline::advisor::{make_proposal, Provider};
use tapeline::ops;
use tapeline::paths::DataRoot;
use tapeline::storage::tables::{append_proposal, read_bars};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Pause after the budget is exhausted before re-checking.
const BUDGET_SLEEP: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "advisord")]
#[command(about = "Compute bar features and emit parameter proposals")]
struct Args {
    #[arg(long, default_value = "SPY")]
    symbol: String,

    #[arg(long, env = "DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    #[arg(long, default_value = "rules")]
    provider: String,

    #[arg(long, default_value_t = 5.0)]
    interval_sec: f64,

    /// Provider spend ceiling for the session.
    #[arg(long, default_value_t = 10.0)]
    budget_usd: f64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    ops::init_tracing("advisord");
    let args = Args::parse();

    let Some(provider) = Provider::parse(&args.provider) else {
        bail!("unknown provider: {}", args.provider);
    };
    let root = DataRoot::new(&args.data_root);
    info!(symbol = %args.symbol, provider = provider.name(), "advisord starting");

    let mut spent = 0.0_f64;
    // Budget pauses are tracked as a deadline rather than slept through,
    // so the heartbeat keeps its 30s freshness while paused.
    let mut paused_until: Option<tokio::time::Instant> = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("stop signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(args.interval_sec)) => {
                ops::beat(&root.heartbeat_path("advisord"))?;

                if let Some(until) = paused_until {
                    if tokio::time::Instant::now() < until {
                        continue;
                    }
                    paused_until = None;
                }

                if spent >= args.budget_usd {
                    warn!(spent, budget = args.budget_usd, "budget exhausted, pausing");
                    paused_until = Some(tokio::time::Instant::now() + BUDGET_SLEEP);
                    continue;
                }

                if let Err(e) = propose_once(&root, &args, provider, &mut spent) {
                    warn!("advisor loop error: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    info!(spent, "advisord stopped");
    Ok(())
}

fn propose_once(
    root: &DataRoot,
    args: &Args,
    provider: Provider,
    spent: &mut f64,
) -> Result<()> {
    let now = chrono::Utc::now();
    let day = now.date_naive();
    let bars_path = root.bars_path(day, &args.symbol);
    if !bars_path.exists() {
        return Ok(());
    }

    let bars = read_bars(&bars_path)?;
    if bars.is_empty() {
        return Ok(());
    }

    let row = make_proposal(&args.symbol, &bars, provider, now);
    append_proposal(&root.proposals_path(day, &args.symbol), &row)?;
    *spent += row.cost_usd;

    info!(
        threshold_bps = row.threshold_bps,
        risk_multiplier = row.risk_multiplier,
        notes = %row.notes,
        "proposal appended"
    );
    Ok(())
}
