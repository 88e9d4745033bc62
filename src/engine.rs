// ===============================
// src/engine.rs
// ===============================
//
// One single-writer worker per instrument, fed by a bounded queue.
// Everything that mutates instrument state (window update, signal check,
// order transition) happens inside that worker, so no locking is needed
// and per-instrument order is the relay order. Instruments run in parallel.
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Event, SignalKind, Snapshot, SnapshotRecord};
use crate::error::PositionError;
use crate::metrics::{self, LatencyKind, EVALUATIONS, SNAPSHOTS_BY_INSTRUMENT};
use crate::positions::PositionManager;
use crate::relay::Subscription;
use crate::store::Store;
use crate::strategy::CrossoverState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub short_window: usize,
    pub long_window: usize,
    /// Per-instrument queue capacity.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason { Validation, Persistence }

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self { DropReason::Validation => "validation", DropReason::Persistence => "persistence" }
    }
}

/// What happened to one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dropped(DropReason),
    WarmingUp,
    NoSignal,
    Transition { signal: SignalKind, price: Decimal },
    /// Transition not applied; state kept so it is retried next tick.
    TransitionDeferred { signal: SignalKind },
    /// Signal emitted but the order or audit write was lost.
    TransitionLost { signal: SignalKind },
}

#[derive(Clone)]
pub struct EngineCtx {
    pub store: Arc<dyn Store>,
    pub positions: PositionManager,
    pub journal: Option<mpsc::Sender<Event>>,
    pub config: EngineConfig,
}

pub struct InstrumentWorker {
    instrument: String,
    state: CrossoverState,
    ctx: Arc<EngineCtx>,
}

impl InstrumentWorker {
    pub fn new(instrument: String, ctx: Arc<EngineCtx>) -> Option<Self> {
        let state = CrossoverState::new(ctx.config.short_window, ctx.config.long_window)?;
        Some(Self { instrument, state, ctx })
    }

    pub fn last_signal(&self) -> SignalKind { self.state.last() }

    pub async fn process(&mut self, snap: Snapshot) -> Outcome {
        let id = snap.latency_id.clone().unwrap_or_default();

        // 1) best bid/ask; an empty side never reaches the averages
        let top = match snap.top_of_book() {
            Ok(t) => t,
            Err(e) => {
                warn!(?e, instrument = %self.instrument, "snapshot rejected");
                metrics::record_error("orderbook_validation_error");
                metrics::record_drop(DropReason::Validation.as_str());
                metrics::cancel_timer(LatencyKind::Snapshot, &id);
                return Outcome::Dropped(DropReason::Validation);
            }
        };

        // 2) persist the snapshot (idempotent on instrument + event_time)
        let rec = SnapshotRecord {
            event_type: snap.event_type,
            instrument: self.instrument.clone(),
            event_time: snap.event_time,
            best_bid: top.bid,
            best_ask: top.ask,
        };
        let snapshot_id = match self.ctx.store.save_snapshot(&rec).await {
            Ok(row_id) => row_id,
            Err(e) => {
                error!(?e, instrument = %self.instrument, "saving snapshot failed");
                metrics::record_error("orderbook_save_error");
                metrics::record_data_loss("orderbook_save_data_loss");
                metrics::record_drop(DropReason::Persistence.as_str());
                metrics::cancel_timer(LatencyKind::Snapshot, &id);
                return Outcome::Dropped(DropReason::Persistence);
            }
        };
        metrics::record_latency(LatencyKind::Snapshot, &id);
        SNAPSHOTS_BY_INSTRUMENT.with_label_values(&[&self.instrument]).inc();
        debug!(
            snapshot_id,
            instrument = %self.instrument,
            event_time = rec.event_time,
            bid = %top.bid,
            ask = %top.ask,
            mid = %top.mid,
            "snapshot"
        );
        if let Some(tx) = &self.ctx.journal {
            let _ = tx.try_send(Event::Snapshot(rec));
        }

        // 3) windows + signal check
        let crossover = match self.state.on_mid(top.mid) {
            Ok(Some(x)) => x,
            Ok(None) => {
                EVALUATIONS.with_label_values(&["warming", &self.instrument]).inc();
                return Outcome::WarmingUp;
            }
            Err(e) => {
                warn!(?e, instrument = %self.instrument, mid = %top.mid, "mid price rejected by the windows");
                metrics::record_error("orderbook_validation_error");
                metrics::record_drop(DropReason::Validation.as_str());
                return Outcome::Dropped(DropReason::Validation);
            }
        };
        if !crossover.is_transition() {
            EVALUATIONS.with_label_values(&["none", &self.instrument]).inc();
            return Outcome::NoSignal;
        }
        let signal = crossover.signal;
        EVALUATIONS.with_label_values(&[&signal.as_str().to_ascii_lowercase(), &self.instrument]).inc();
        info!(
            instrument = %self.instrument,
            signal = signal.as_str(),
            short = %crossover.short_avg,
            long = %crossover.long_avg,
            reason = crossover.reason,
            "crossover"
        );

        // 4) order transition
        metrics::start_timer(LatencyKind::Signal, &id);
        metrics::start_timer(LatencyKind::Order, &id);
        match self.ctx.positions.on_signal(&self.instrument, &crossover, top.mid).await {
            Ok(_) => {
                self.state.commit(signal);
                metrics::record_latency(LatencyKind::Order, &id);
                metrics::record_latency(LatencyKind::Signal, &id);
                Outcome::Transition { signal, price: top.mid }
            }
            Err(e) => {
                metrics::cancel_timer(LatencyKind::Order, &id);
                metrics::cancel_timer(LatencyKind::Signal, &id);
                if e.commits_signal() {
                    error!(?e, instrument = %self.instrument, "signal emitted but not fully persisted");
                    metrics::record_error("order_save_error");
                    metrics::record_data_loss("order_save_data_loss");
                    self.state.commit(signal);
                    Outcome::TransitionLost { signal }
                } else {
                    warn!(?e, instrument = %self.instrument, "order transition deferred");
                    metrics::record_error(match &e {
                        PositionError::Lookup(_) => "order_lookup_error",
                        _ => "order_close_error",
                    });
                    Outcome::TransitionDeferred { signal }
                }
            }
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Snapshot>) {
        info!(instrument = %self.instrument, "worker started");
        while let Some(snap) = rx.recv().await {
            self.process(snap).await;
        }
        info!(instrument = %self.instrument, last = self.state.last().as_str(), "worker drained");
    }
}

/// Instrument -> worker queue. Workers are created on first sight and
/// live until shutdown.
pub struct Registry {
    ctx: Arc<EngineCtx>,
    workers: HashMap<String, mpsc::Sender<Snapshot>>,
    handles: Vec<JoinHandle<()>>,
}

impl Registry {
    pub fn new(ctx: EngineCtx) -> Self {
        Self { ctx: Arc::new(ctx), workers: HashMap::new(), handles: Vec::new() }
    }

    pub fn instruments(&self) -> usize { self.workers.len() }

    fn spawn_worker(&mut self, instrument: &str) -> Option<mpsc::Sender<Snapshot>> {
        let worker = InstrumentWorker::new(instrument.to_string(), self.ctx.clone())?;
        let (tx, rx) = mpsc::channel(self.ctx.config.queue_capacity.max(1));
        self.handles.push(tokio::spawn(worker.run(rx)));
        self.workers.insert(instrument.to_string(), tx.clone());
        Some(tx)
    }

    /// Queue a snapshot for its instrument; waits while that queue is full.
    pub async fn dispatch(&mut self, snap: Snapshot) {
        let tx = match self.workers.get(&snap.instrument) {
            Some(tx) => tx.clone(),
            None => match self.spawn_worker(&snap.instrument) {
                Some(tx) => tx,
                None => {
                    error!(instrument = %snap.instrument, "invalid window configuration, snapshot dropped");
                    metrics::record_drop("config");
                    cancel_snapshot_timer(&snap);
                    return;
                }
            },
        };
        if let Err(e) = tx.send(snap).await {
            error!(instrument = %e.0.instrument, "worker gone, snapshot dropped");
            metrics::record_data_loss("worker_gone");
            cancel_snapshot_timer(&e.0);
        }
    }

    /// Close every queue and wait for the workers to finish what is queued.
    pub async fn shutdown(mut self) {
        self.workers.clear();
        for h in self.handles.drain(..) {
            if let Err(e) = h.await {
                error!(?e, "worker task failed");
            }
        }
    }
}

fn cancel_snapshot_timer(snap: &Snapshot) {
    if let Some(id) = &snap.latency_id {
        metrics::cancel_timer(LatencyKind::Snapshot, id);
    }
}

/// Pull snapshots off the relay until cancelled or the relay closes.
/// On cancel, snapshots already buffered in the subscription are still
/// dispatched; then the workers drain their queues.
pub async fn run_dispatch(mut sub: Subscription, mut registry: Registry, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let mut buffered = 0usize;
                while let Some(snap) = sub.try_next() {
                    registry.dispatch(snap).await;
                    buffered += 1;
                }
                if buffered > 0 {
                    info!(buffered, "dispatched buffered snapshots after cancel");
                }
                break;
            }
            s = sub.next() => s,
        };
        match next {
            Some(snap) => registry.dispatch(snap).await,
            None => {
                warn!("relay subscription closed");
                break;
            }
        }
    }
    info!(instruments = registry.instruments(), "dispatcher stopping, draining workers");
    registry.shutdown().await;
}
