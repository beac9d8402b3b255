//! Execution worker loop.
//!
//! Reserves intents from the durable queue, re-checks idempotency
//! against the ledger, runs the pretrade gate, places through the
//! broker port, and drives every subsequent broker event through the
//! order state machine while appending the lifecycle to the ledger.
//!
//! Failure policy: risk rejects are dead-lettered (policy violations do
//! not retry); placement transport faults are nacked for retry up to
//! the queue's max attempts; a tag that already reached the ledger is
//! acked without resubmission, which is what makes crash/restart safe.

use crate::broker::{Broker, BrokerError, OrderEvent, Placement};
use crate::models::NewOrder;
use crate::paths::DataRoot;
use crate::queue::IntentQueue;
use crate::risk::{pretrade_check, RiskConfig};
use crate::storage::ledger::{append_ledger, read_ledger, LedgerKind, LedgerRecord};
use crate::execution::state_machine::{ExecState, OrderState};
use crate::storage::tables::{arrival_close, read_bars};
use crate::tca::Tca;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const INTENT_TOPIC: &str = "order_intents";

const DEFAULT_ACK_WINDOW: Duration = Duration::from_secs(8);
/// Grace period after an active cancel for the terminal event to land.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Ack window: 8s baseline, stretched to 4x the observed p95 when the
/// `ACK_P95_MS` override is set.
pub fn ack_window(ack_p95_ms: Option<u64>) -> Duration {
    match ack_p95_ms {
        Some(ms) => DEFAULT_ACK_WINDOW.max(Duration::from_millis(ms.saturating_mul(4))),
        None => DEFAULT_ACK_WINDOW,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TagState {
    has_intent: bool,
    /// ACK or any later lifecycle row: the broker saw this tag.
    submitted: bool,
}

fn ledger_tag_state(path: &std::path::Path, tag: &str) -> Result<TagState> {
    let mut st = TagState::default();
    for r in read_ledger(path)? {
        if r.tag != tag {
            continue;
        }
        match r.kind {
            LedgerKind::Intent => st.has_intent = true,
            LedgerKind::Ack
            | LedgerKind::Partial
            | LedgerKind::Fill
            | LedgerKind::Cancel
            | LedgerKind::PnlSnapshot => st.submitted = true,
            LedgerKind::IntentShadow | LedgerKind::Rej => {}
        }
    }
    Ok(st)
}

#[derive(Debug, Clone)]
pub struct ExecWorkerConfig {
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub ack_window: Duration,
    pub order_ttl: Duration,
}

impl Default for ExecWorkerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(10),
            max_attempts: 10,
            ack_window: DEFAULT_ACK_WINDOW,
            order_ttl: Duration::from_secs(30),
        }
    }
}

pub struct ExecWorker {
    queue: IntentQueue,
    root: DataRoot,
    risk: RiskConfig,
    broker: Arc<dyn Broker>,
    cfg: ExecWorkerConfig,
}

impl ExecWorker {
    pub fn new(
        queue: IntentQueue,
        root: DataRoot,
        risk: RiskConfig,
        broker: Arc<dyn Broker>,
        cfg: ExecWorkerConfig,
    ) -> Self {
        Self {
            queue,
            root,
            risk,
            broker,
            cfg,
        }
    }

    /// Process at most one reserved intent. Returns whether anything was
    /// reserved, so the caller can idle-sleep on an empty queue.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(msg) = self.queue.reserve(
            INTENT_TOPIC,
            self.cfg.visibility_timeout,
            self.cfg.max_attempts,
        )?
        else {
            return Ok(false);
        };

        let order: NewOrder = match serde_json::from_str(&msg.payload) {
            Ok(o) => o,
            Err(e) => {
                warn!(tag = %msg.tag, "undecodable intent payload: {e}; dead-lettering");
                self.queue.nack(msg.id, true)?;
                return Ok(true);
            }
        };

        let now = Utc::now();
        let day = now.date_naive();
        let ledger_path = self.root.ledger_path(day);

        // Idempotency re-check across restarts. A tag with submission
        // evidence (ACK or later) must never be resubmitted; a tag whose
        // previous attempt died before ack may retry, but its INTENT row
        // is recorded only once.
        let prior = ledger_tag_state(&ledger_path, &msg.tag)?;
        if prior.submitted {
            info!(tag = %msg.tag, "tag already submitted, skipping");
            self.queue.ack(msg.id)?;
            return Ok(true);
        }

        if !prior.has_intent {
            let mut intent = LedgerRecord::new(LedgerKind::Intent, &msg.tag, order.ts);
            intent.event_ts = Some(now);
            intent.symbol = Some(order.symbol.clone());
            intent.side = Some(order.side);
            intent.qty = Some(order.qty);
            intent.limit = order.limit;
            append_ledger(&ledger_path, &[intent])?;
        }

        let bars = read_bars(&self.root.bars_path(day, &order.symbol)).unwrap_or_else(|e| {
            warn!("unreadable bars for arrival price: {e:#}");
            Vec::new()
        });
        let arrival = arrival_close(&bars, order.ts);
        let last_px = arrival.or(order.limit).unwrap_or(0.0);

        let (ok, reason) = pretrade_check(&order, last_px, &self.risk);
        if !ok {
            warn!(tag = %msg.tag, %reason, "pretrade reject");
            let mut rej = LedgerRecord::new(LedgerKind::Rej, &msg.tag, order.ts);
            rej.event_ts = Some(Utc::now());
            rej.reason = Some(reason);
            append_ledger(&ledger_path, &[rej])?;
            self.queue.nack(msg.id, true)?;
            return Ok(true);
        }

        let placement = match tokio::time::timeout(
            self.cfg.ack_window,
            self.broker.place(&order),
        )
        .await
        {
            Ok(Ok(p)) => p,
            Ok(Err(BrokerError::Rejected(reason))) => {
                // The venue said no; replaying the tag would be skipped
                // by the idempotency check anyway, so this is terminal.
                warn!(tag = %msg.tag, %reason, "broker rejected");
                let mut rej = LedgerRecord::new(LedgerKind::Rej, &msg.tag, order.ts);
                rej.event_ts = Some(Utc::now());
                rej.reason = Some(reason);
                append_ledger(&ledger_path, &[rej])?;
                self.queue.ack(msg.id)?;
                return Ok(true);
            }
            Ok(Err(BrokerError::Transport(reason))) => {
                warn!(tag = %msg.tag, %reason, "placement transport fault, will retry");
                let mut rej = LedgerRecord::new(LedgerKind::Rej, &msg.tag, order.ts);
                rej.event_ts = Some(Utc::now());
                rej.reason = Some(reason);
                append_ledger(&ledger_path, &[rej])?;
                self.queue.nack(msg.id, false)?;
                return Ok(true);
            }
            Err(_) => {
                let reason = format!("no ack within {:?}", self.cfg.ack_window);
                warn!(tag = %msg.tag, %reason, "ack window elapsed, will retry");
                let mut rej = LedgerRecord::new(LedgerKind::Rej, &msg.tag, order.ts);
                rej.event_ts = Some(Utc::now());
                rej.reason = Some(reason);
                append_ledger(&ledger_path, &[rej])?;
                self.queue.nack(msg.id, false)?;
                return Ok(true);
            }
        };

        let mut state = ExecState::new(
            msg.tag.clone(),
            order.symbol.clone(),
            order.side,
            order.qty,
            order.ts,
        );
        state.on_ack(placement.ack_ts);

        let mut ack = LedgerRecord::new(LedgerKind::Ack, &msg.tag, order.ts);
        ack.event_ts = Some(placement.ack_ts);
        ack.symbol = Some(order.symbol.clone());
        append_ledger(&ledger_path, &[ack])?;

        self.drive_order(&order, &mut state, placement, &ledger_path)
            .await?;

        if state.fill_qty > 0.0 {
            if let Some(arrival) = arrival {
                let tca = Tca {
                    arrival,
                    fills_wavg: state.avg_fill_px,
                    side: order.side,
                };
                let mut snap = LedgerRecord::new(LedgerKind::PnlSnapshot, &msg.tag, order.ts);
                snap.event_ts = Some(Utc::now());
                snap.symbol = Some(order.symbol.clone());
                snap.avg_px = Some(state.avg_fill_px);
                snap.fill_qty = Some(state.fill_qty);
                snap.shortfall_bps = Some(tca.shortfall_bps());
                append_ledger(&ledger_path, &[snap])?;
            }
            crate::accounting::positions::write_snapshot(
                &ledger_path,
                &self.root.positions_path(day),
            )?;
        }

        info!(
            tag = %msg.tag,
            state = state.state.as_str(),
            fill_qty = state.fill_qty,
            avg_px = state.avg_fill_px,
            "order complete"
        );
        self.queue.ack(msg.id)?;
        Ok(true)
    }

    /// Drain broker events into the state machine until a terminal
    /// state, actively canceling at TTL expiry.
    async fn drive_order(
        &self,
        order: &NewOrder,
        state: &mut ExecState,
        mut placement: Placement,
        ledger_path: &std::path::Path,
    ) -> Result<()> {
        let mut deadline = Instant::now() + self.cfg.order_ttl;
        let mut cancel_requested = false;

        while !state.state.is_terminal() {
            match tokio::time::timeout_at(deadline, placement.events.recv()).await {
                Ok(Some(OrderEvent::Partial { ts, px, qty })) => {
                    state.on_partial(ts, px, qty);
                    let kind = if state.state == OrderState::Fill {
                        LedgerKind::Fill
                    } else {
                        LedgerKind::Partial
                    };
                    let mut row = LedgerRecord::new(kind, &state.tag, order.ts);
                    row.event_ts = Some(ts);
                    row.symbol = Some(order.symbol.clone());
                    row.side = Some(order.side);
                    row.fill_qty = Some(qty);
                    row.avg_px = Some(state.avg_fill_px);
                    append_ledger(ledger_path, &[row])?;
                }
                Ok(Some(OrderEvent::Cancel { ts })) => {
                    state.on_cancel(ts);
                    let mut row = LedgerRecord::new(LedgerKind::Cancel, &state.tag, order.ts);
                    row.event_ts = Some(ts);
                    row.symbol = Some(order.symbol.clone());
                    append_ledger(ledger_path, &[row])?;
                }
                Ok(Some(OrderEvent::Reject { ts, reason })) => {
                    state.on_rej(ts, &reason);
                    let mut row = LedgerRecord::new(LedgerKind::Rej, &state.tag, order.ts);
                    row.event_ts = Some(ts);
                    row.reason = Some(reason);
                    append_ledger(ledger_path, &[row])?;
                }
                Ok(None) => {
                    // Event stream ended without a terminal event.
                    warn!(tag = %state.tag, "broker event stream closed early");
                    let ts = Utc::now();
                    state.on_cancel(ts);
                    let mut row = LedgerRecord::new(LedgerKind::Cancel, &state.tag, order.ts);
                    row.event_ts = Some(ts);
                    row.symbol = Some(order.symbol.clone());
                    append_ledger(ledger_path, &[row])?;
                }
                Err(_) if !cancel_requested => {
                    info!(tag = %state.tag, "TTL expired, canceling");
                    if let Err(e) = self.broker.cancel(&placement.handle).await {
                        warn!(tag = %state.tag, "cancel failed: {e}");
                    }
                    cancel_requested = true;
                    deadline = Instant::now() + CANCEL_GRACE;
                }
                Err(_) => {
                    // The cancel grace also elapsed; close out locally.
                    let ts = Utc::now();
                    state.on_cancel(ts);
                    let mut row = LedgerRecord::new(LedgerKind::Cancel, &state.tag, order.ts);
                    row.event_ts = Some(ts);
                    row.symbol = Some(order.symbol.clone());
                    append_ledger(ledger_path, &[row])?;
                }
            }
        }

        Ok(())
    }
}
