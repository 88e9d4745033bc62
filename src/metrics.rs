// ===============================
// src/metrics.rs
// ===============================
//
// Observability port. Every function here is fire-and-forget: a metric
// that cannot be recorded is skipped, never propagated to the pipeline.
//
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::health::Readiness;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SNAPSHOTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("snapshots_total", "order-book snapshots received").unwrap());

pub static SNAPSHOTS_BY_INSTRUMENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshots_processed_total", "snapshots processed per instrument"),
        &["instrument"],
    )
    .unwrap()
});

pub static DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshots_dropped_total", "snapshots dropped (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

// outcome: buy / sell / none / warming
pub static EVALUATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signal_evaluations_total", "signal checks by outcome"),
        &["outcome", "instrument"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_opened_total", "orders opened"), &["side"]).unwrap()
});

pub static ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("error_count", "errors by type"), &["error_type"]).unwrap()
});

pub static DATA_LOSS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dataloss_error_count", "data loss events by type"),
        &["data_loss_type"],
    )
    .unwrap()
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reconnects_total", "reconnect attempts (label: target)"),
        &["target"],
    )
    .unwrap()
});

pub static CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("dependency_connected", "1 if dependency connected, 0 otherwise"),
        &["target"],
    )
    .unwrap()
});

pub static LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("processing_latency_seconds", "pipeline stage latency (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

/// A timer older than this is assumed lost (lagged subscriber, dropped snapshot).
const TIMER_TTL: Duration = Duration::from_secs(30);
const MAX_TIMERS: usize = 100_000;

static TIMERS: Lazy<Mutex<TimerTable>> = Lazy::new(|| Mutex::new(TimerTable::new(TIMER_TTL, MAX_TIMERS)));

/// Pending latency timers, bounded by age and count.
#[derive(Debug)]
pub struct TimerTable {
    started: HashMap<(LatencyKind, String), Instant>,
    ttl: Duration,
    max: usize,
    last_sweep: Instant,
}

impl TimerTable {
    pub fn new(ttl: Duration, max: usize) -> Self {
        Self { started: HashMap::new(), ttl, max: max.max(1), last_sweep: Instant::now() }
    }

    /// `false` if the table is full of live timers and this one was not kept.
    pub fn start(&mut self, kind: LatencyKind, id: &str, now: Instant) -> bool {
        if now.duration_since(self.last_sweep) >= self.ttl || self.started.len() >= self.max {
            self.sweep(now);
        }
        if self.started.len() >= self.max {
            return false;
        }
        self.started.insert((kind, id.to_string()), now);
        true
    }

    pub fn finish(&mut self, kind: LatencyKind, id: &str) -> Option<Instant> {
        self.started.remove(&(kind, id.to_string()))
    }

    /// Forget timers started more than `ttl` before `now`; returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.started.len();
        let ttl = self.ttl;
        self.started.retain(|_, t0| now.duration_since(*t0) < ttl);
        self.last_sweep = now;
        before - self.started.len()
    }

    pub fn len(&self) -> usize { self.started.len() }

    pub fn is_empty(&self) -> bool { self.started.is_empty() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyKind {
    /// Raw message received -> snapshot persisted.
    Snapshot,
    /// Snapshot persisted -> signal recorded.
    Signal,
    /// Snapshot persisted -> order opened.
    Order,
}

impl LatencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyKind::Snapshot => "snapshot",
            LatencyKind::Signal => "signal",
            LatencyKind::Order => "order",
        }
    }
}

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(SNAPSHOTS.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_BY_INSTRUMENT.clone())),
        REGISTRY.register(Box::new(DROPPED.clone())),
        REGISTRY.register(Box::new(EVALUATIONS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(ERRORS.clone())),
        REGISTRY.register(Box::new(DATA_LOSS.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(CONNECTED.clone())),
        REGISTRY.register(Box::new(LATENCY.clone())),
    ] {
        let _ = m;
    }
}

pub fn start_timer(kind: LatencyKind, id: &str) {
    if let Ok(mut timers) = TIMERS.lock() {
        if !timers.start(kind, id, Instant::now()) {
            debug!(kind = kind.as_str(), "latency timer table full, not timed");
        }
    }
}

/// Observe the time since the matching `start_timer`. Unknown ids are ignored.
pub fn record_latency(kind: LatencyKind, id: &str) {
    let started = match TIMERS.lock() {
        Ok(mut timers) => timers.finish(kind, id),
        Err(_) => None,
    };
    if let Some(t0) = started {
        LATENCY.with_label_values(&[kind.as_str()]).observe(t0.elapsed().as_secs_f64());
    }
}

/// Drop a timer that will never complete (e.g. no signal on this tick).
pub fn cancel_timer(kind: LatencyKind, id: &str) {
    if let Ok(mut timers) = TIMERS.lock() {
        timers.finish(kind, id);
    }
}

/// Expire timers whose snapshot can no longer arrive.
pub fn sweep_timers() {
    if let Ok(mut timers) = TIMERS.lock() {
        let expired = timers.sweep(Instant::now());
        if expired > 0 {
            debug!(expired, "latency timers expired");
        }
    }
}

pub fn record_error(kind: &str) {
    ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_data_loss(kind: &str) {
    DATA_LOSS.with_label_values(&[kind]).inc();
}

pub fn record_drop(reason: &str) {
    DROPPED.with_label_values(&[reason]).inc();
}

pub fn set_connected(target: &str, up: bool) {
    CONNECTED.with_label_values(&[target]).set(up as i64);
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn request_path(req: &[u8]) -> &str {
    std::str::from_utf8(req)
        .ok()
        .and_then(|s| s.lines().next())
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}

// Tiny HTTP 1.1 responder: /metrics (and /), /healthz, /readyz
fn handle_client(mut stream: TcpStream, readiness: &Readiness) {
    let mut req_buf = [0u8; 1024];
    let n = stream.read(&mut req_buf).unwrap_or(0);

    let (status, content_type, body) = match request_path(&req_buf[..n]) {
        "/healthz" => ("200 OK", "application/json", Readiness::liveness_body().into_bytes()),
        "/readyz" => {
            let (ready, body) = readiness.report();
            let status = if ready { "200 OK" } else { "503 Service Unavailable" };
            (status, "application/json", body.into_bytes())
        }
        _ => ("200 OK", "text/plain; version=0.0.4; charset=utf-8", encode_metrics()),
    };
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the HTTP server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve(port: u16, readiness: Readiness) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening (/metrics, /healthz, /readyz)");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream, &readiness),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
    Ok(())
}
