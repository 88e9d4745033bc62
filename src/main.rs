// ===============================
// src/main.rs
// ===============================
/*
 # readiness / liveness / metrics
curl -s localhost:9898/readyz
curl -s localhost:9898/metrics | grep '^signal_evaluations_total'
curl -s localhost:9898/metrics | grep '^orders_opened_total'

 # offline run with the random-walk feed
FEED_MODE=mock SYMBOLS=BTCUSDT,ETHUSDT SHORT_WINDOW=5 LONG_WINDOW=20 cargo run
*/
/*
=============================================================================
Project : sma_crossover_bot — async SMA crossover signal engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT

Summary : Streams order-book depth (websocket/mock), relays snapshots over
          pub/sub, keeps short/long moving averages per instrument, emits
          crossover signals, keeps one open order per instrument, exposes
          Prometheus metrics and records JSONL events.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sma_crossover_bot::{
    config::{self, Args, FeedMode},
    domain::Event,
    engine::{self, EngineConfig, EngineCtx, Registry},
    error::PipelineError,
    feed::{self, Connector, FeedAdapter, MockConnector, WsConnector},
    health::{self, Readiness},
    metrics,
    positions::PositionManager,
    recorder,
    relay::{Broker, LocalBroker, Relay},
    store::{MemoryStore, Store},
};

const PROBE_EVERY: Duration = Duration::from_secs(10);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    init_logging();

    // ---- Load config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            error!(%e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        feed_mode = args.feed_mode.as_str(),
        stream_url = %args.stream_url,
        symbols = ?args.symbols,
        short_window = args.short_window,
        long_window = args.long_window,
        broker = %args.broker_addr,
        topic = %args.relay_topic,
        "startup config"
    );

    metrics::init();

    let result = match args.feed_mode {
        FeedMode::Mock => {
            let adapter = FeedAdapter::new(MockConnector::new(args.symbols.clone()), "mock://feed", args.retry);
            run(args, adapter).await
        }
        FeedMode::Live => {
            let adapter = FeedAdapter::new(WsConnector, args.stream_url.clone(), args.retry);
            run(args, adapter).await
        }
    };

    match result {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "pipeline stopped on fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run<C: Connector>(args: Args, adapter: FeedAdapter<C>) -> Result<(), PipelineError> {
    let cancel = CancellationToken::new();

    // ---- Persistence ----
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    // ---- Recorder (optional) ----
    let (journal, recorder_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            let task = tokio::spawn(async move {
                if let Err(e) = recorder::run(rx, path).await {
                    error!(?e, "recorder stopped");
                }
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    // ---- Relay ----
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new(args.broker_addr.clone(), args.relay_capacity));
    let relay = Arc::new(Relay::connect(broker, args.retry).await.map_err(PipelineError::from_relay)?);

    // ---- Metrics + health HTTP ----
    let readiness = Readiness::new(adapter.connected_flag(), relay.connected_flag());
    metrics::serve(args.metrics_port, readiness.clone())?;
    let probe = tokio::spawn(health::run_probe(
        readiness,
        store.clone(),
        relay.clone(),
        PROBE_EVERY,
        cancel.clone(),
    ));

    // ---- Engine: subscribe before the feed starts publishing ----
    let ctx = EngineCtx {
        store: store.clone(),
        positions: PositionManager::new(store.clone(), args.order_qty, journal.clone()),
        journal: journal.clone(),
        config: EngineConfig {
            short_window: args.short_window,
            long_window: args.long_window,
            queue_capacity: args.max_price_count,
        },
    };
    let dispatcher = tokio::spawn(engine::run_dispatch(
        relay.subscribe(&args.relay_topic),
        Registry::new(ctx),
        cancel.clone(),
    ));

    // ---- Ingest until Ctrl-C or a fatal error ----
    let ingest = feed::run_ingest(&adapter, &relay, &args.relay_topic, cancel.clone());
    tokio::pin!(ingest);
    let finished = tokio::select! {
        r = &mut ingest => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(r) => r,
        None => {
            info!("ctrl-c received, shutting down");
            cancel.cancel();
            ingest.await
        }
    };

    // ---- Drain ----
    cancel.cancel();
    if let Err(e) = dispatcher.await {
        warn!(?e, "dispatcher task failed");
    }
    let _ = probe.await;
    store.close().await;
    drop(journal);
    if let Some(task) = recorder_task {
        let _ = task.await;
    }
    outcome
}
