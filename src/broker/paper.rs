//! In-process paper broker.
//!
//! Acks immediately and pumps simulated fills onto the event stream
//! after a configurable delay: limit orders fill at their limit price,
//! market orders at the symbol's reference price with a little random
//! slippage. Quantities of 2+ fill in two slices so partial-fill
//! handling is exercised end to end. `EXEC_ENV=paper` selects this
//! implementation.

use super::{Broker, BrokerError, BrokerHandle, OrderEvent, Placement};
use crate::models::NewOrder;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub struct PaperBroker {
    fill_delay: Duration,
    reference_px: Arc<RwLock<HashMap<String, f64>>>,
    cancel_signals: Arc<Mutex<HashMap<String, mpsc::Sender<()>>>>,
    seq: AtomicU64,
}

impl PaperBroker {
    pub fn new(fill_delay: Duration) -> Self {
        Self {
            fill_delay,
            reference_px: Arc::new(RwLock::new(HashMap::new())),
            cancel_signals: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(1),
        }
    }

    /// Reference price for market orders without a limit.
    pub fn set_reference_px(&self, symbol: &str, px: f64) {
        self.reference_px.write().insert(symbol.to_string(), px);
    }

    fn fill_px(&self, order: &NewOrder) -> Result<f64, BrokerError> {
        if let Some(limit) = order.limit {
            return Ok(limit);
        }
        let reference = self
            .reference_px
            .read()
            .get(&order.symbol)
            .copied()
            .ok_or_else(|| {
                BrokerError::Rejected(format!("no reference price for {}", order.symbol))
            })?;
        // +/-1bp of simulated slippage.
        let slip: f64 = rand::thread_rng().gen_range(-1.0..=1.0) * 1e-4;
        Ok(reference * (1.0 + slip))
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place(&self, order: &NewOrder) -> Result<Placement, BrokerError> {
        if order.qty <= 0.0 {
            return Err(BrokerError::Rejected(format!("bad qty {}", order.qty)));
        }
        let px = self.fill_px(order)?;

        let id = format!("paper-{}", self.seq.fetch_add(1, Ordering::Relaxed));
        let (event_tx, event_rx) = mpsc::channel(8);
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        self.cancel_signals.lock().insert(id.clone(), cancel_tx);

        // Two slices for qty >= 2 so partial-fill paths get exercised.
        let slices: Vec<f64> = if order.qty >= 2.0 {
            let first = (order.qty / 2.0).floor().max(1.0);
            vec![first, order.qty - first]
        } else {
            vec![order.qty]
        };

        let delay = self.fill_delay;
        let cancel_signals = self.cancel_signals.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            for qty in slices {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let ev = OrderEvent::Partial { ts: Utc::now(), px, qty };
                        if event_tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    _ = cancel_rx.recv() => {
                        debug!(handle = %task_id, "paper order canceled");
                        let _ = event_tx.send(OrderEvent::Cancel { ts: Utc::now() }).await;
                        break;
                    }
                }
            }
            cancel_signals.lock().remove(&task_id);
        });

        Ok(Placement {
            handle: BrokerHandle(id),
            ack_ts: Utc::now(),
            events: event_rx,
        })
    }

    async fn cancel(&self, handle: &BrokerHandle) -> Result<(), BrokerError> {
        // Unknown handle means the order already reached a terminal
        // state; cancel is a no-op then.
        let tx = self.cancel_signals.lock().get(&handle.0).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        Ok(())
    }
}
