// ===============================
// src/health.rs
// ===============================
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::relay::Relay;
use crate::store::Store;

/// Shared connection flags read by `/readyz`.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    pub feed: Arc<AtomicBool>,
    pub relay: Arc<AtomicBool>,
    pub store: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new(feed: Arc<AtomicBool>, relay: Arc<AtomicBool>) -> Self {
        Self { feed, relay, store: Arc::new(AtomicBool::new(false)) }
    }

    /// `(ready, json body)`; the first unreachable dependency is named.
    pub fn report(&self) -> (bool, String) {
        let checks = [
            (&self.store, "database unreachable"),
            (&self.relay, "broker unreachable"),
            (&self.feed, "websocket unreachable"),
        ];
        for (flag, reason) in checks {
            if !flag.load(Ordering::Relaxed) {
                return (false, format!(r#"{{"status":"not ready","reason":"{reason}"}}"#));
            }
        }
        (true, format!(r#"{{"status":"ready","time":"{}"}}"#, Utc::now().to_rfc3339()))
    }

    pub fn liveness_body() -> String {
        format!(r#"{{"status":"alive","time":"{}"}}"#, Utc::now().to_rfc3339())
    }
}

/// Pings store and broker every `every` until cancelled.
pub async fn run_probe(
    readiness: Readiness,
    store: Arc<dyn Store>,
    relay: Arc<Relay>,
    every: Duration,
    cancel: CancellationToken,
) {
    loop {
        let store_ok = match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(?e, "store ping failed");
                false
            }
        };
        readiness.store.store(store_ok, Ordering::Relaxed);
        crate::metrics::set_connected("store", store_ok);

        // relay keeps its own flag; a failed ping only clears it
        if relay.ping().await.is_err() {
            readiness.relay.store(false, Ordering::Relaxed);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
}
