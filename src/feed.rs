// ===============================
// src/feed.rs
// ===============================
//
// Market data transport:
// - WsConnector   : websocket depth stream (tokio-tungstenite)
// - MockConnector : random-walk depth generator (~200 msgs/s)
// - FeedAdapter   : connect with bounded retry + "connected" flag
// - run_ingest    : read -> normalize -> publish on the relay; owns reconnects
//
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt; // for .next()
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::book;
use crate::error::{FeedError, PipelineError, RelayError, RetryExhausted};
use crate::metrics::{self, LatencyKind, SNAPSHOTS};
use crate::relay::Relay;
use crate::retry::{with_retry, RetryPolicy};

#[async_trait]
pub trait MessageStream: Send {
    /// Next raw text message. `ConnectionLost` means the handle is dead.
    async fn receive(&mut self) -> Result<String, FeedError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: MessageStream;
    async fn connect(&self, endpoint: &str) -> Result<Self::Stream, FeedError>;
}

// ---------------------------------------------------------------------------
// Websocket
// ---------------------------------------------------------------------------
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

pub struct WsStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connector for WsConnector {
    type Stream = WsStream;

    async fn connect(&self, endpoint: &str) -> Result<WsStream, FeedError> {
        let url = Url::parse(endpoint).map_err(|e| FeedError::Connect {
            endpoint: endpoint.to_string(),
            reason: format!("bad ws url: {e}"),
        })?;
        let (ws, _resp) = connect_async(url).await.map_err(|e| FeedError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(WsStream { ws })
    }
}

#[async_trait]
impl MessageStream for WsStream {
    async fn receive(&mut self) -> Result<String, FeedError> {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Text(txt)) => return Ok(txt),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(txt) => return Ok(txt),
                    Err(e) => warn!(?e, "non-utf8 binary frame ignored"),
                },
                Ok(Message::Close(frame)) => {
                    return Err(FeedError::ConnectionLost(format!("closed by peer: {frame:?}")));
                }
                // ping/pong are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => return Err(FeedError::ConnectionLost(e.to_string())),
            }
        }
        Err(FeedError::ConnectionLost("stream ended".into()))
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MockConnector {
    pub symbols: Vec<String>,
    pub every: Duration,
}

impl MockConnector {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols, every: Duration::from_millis(5) }
    }
}

pub struct MockStream {
    // (symbol, bid in cents)
    books: Vec<(String, i64)>,
    next: usize,
    tick: Interval,
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = MockStream;

    async fn connect(&self, _endpoint: &str) -> Result<MockStream, FeedError> {
        let mut tick = interval(self.every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(MockStream {
            books: self.symbols.iter().map(|s| (s.clone(), 100_00)).collect(),
            next: 0,
            tick,
        })
    }
}

#[async_trait]
impl MessageStream for MockStream {
    async fn receive(&mut self) -> Result<String, FeedError> {
        self.tick.tick().await;
        if self.books.is_empty() {
            return Err(FeedError::ConnectionLost("mock feed has no symbols".into()));
        }
        let i = self.next % self.books.len();
        self.next = self.next.wrapping_add(1);
        // don't keep ThreadRng across .await
        let step = rand::thread_rng().gen_range(-3..=3);
        let (symbol, bid) = &mut self.books[i];
        *bid = (*bid + step).max(50_00);
        let px = |cents: i64| format!("{}.{:02}", cents / 100, cents % 100);
        let msg = serde_json::json!({
            "e": "depthUpdate",
            "E": Utc::now().timestamp_millis(),
            "s": symbol,
            "b": [[px(*bid), "1.0"], [px(*bid - 1), "2.5"]],
            "a": [[px(*bid + 1), "1.0"], [px(*bid + 2), "2.5"]],
        });
        Ok(msg.to_string())
    }
}

// ---------------------------------------------------------------------------
// Adapter + ingest loop
// ---------------------------------------------------------------------------
pub struct FeedAdapter<C: Connector> {
    connector: C,
    endpoint: String,
    policy: RetryPolicy,
    connected: Arc<AtomicBool>,
}

impl<C: Connector> FeedAdapter<C> {
    pub fn new(connector: C, endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self { connector, endpoint: endpoint.into(), policy, connected: Arc::new(AtomicBool::new(false)) }
    }

    /// Connect with the bounded retry policy. Exhaustion is fatal.
    pub async fn connect(&self) -> Result<C::Stream, RetryExhausted> {
        let stream = with_retry(&self.policy, "websocket", || self.connector.connect(&self.endpoint)).await?;
        info!(endpoint = %self.endpoint, "feed connected");
        self.set_connected(true);
        Ok(stream)
    }

    pub fn mark_disconnected(&self) { self.set_connected(false); }

    pub fn is_connected(&self) -> bool { self.connected.load(Ordering::Relaxed) }

    pub fn connected_flag(&self) -> Arc<AtomicBool> { self.connected.clone() }

    fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
        metrics::set_connected("websocket", up);
    }
}

/// Drive the feed until cancelled. A dropped connection is reconnected;
/// only an exhausted retry budget (feed or relay) ends the loop with an error.
pub async fn run_ingest<C: Connector>(
    adapter: &FeedAdapter<C>,
    relay: &Relay,
    topic: &str,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            s = adapter.connect() => s?,
        };

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("ingest: cancelled, no more reads");
                    adapter.mark_disconnected();
                    return Ok(());
                }
                m = stream.receive() => m,
            };
            match msg {
                Ok(raw) => ingest_one(&raw, relay, topic).await?,
                Err(e) => {
                    warn!(?e, "feed dropped, reconnecting");
                    metrics::record_error("websocket_read_error");
                    adapter.mark_disconnected();
                    break;
                }
            }
        }
    }
}

async fn ingest_one(raw: &str, relay: &Relay, topic: &str) -> Result<(), PipelineError> {
    SNAPSHOTS.inc();
    let mut snap = match book::normalize(raw) {
        Ok(s) => s,
        Err(e) => {
            debug!(?e, "unparsable feed message dropped");
            metrics::record_error("feed_unmarshal_error");
            metrics::record_drop("parse");
            return Ok(());
        }
    };
    let id = Uuid::new_v4().to_string();
    metrics::start_timer(LatencyKind::Snapshot, &id);
    snap.latency_id = Some(id.clone());

    match relay.publish(topic, &snap).await {
        Ok(0) => {
            // nobody will finish this timer
            metrics::cancel_timer(LatencyKind::Snapshot, &id);
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e @ RelayError::Fatal(_)) => {
            metrics::cancel_timer(LatencyKind::Snapshot, &id);
            Err(PipelineError::from_relay(e))
        }
        Err(e) => {
            warn!(?e, instrument = %snap.instrument, "relay publish failed, snapshot dropped");
            metrics::cancel_timer(LatencyKind::Snapshot, &id);
            metrics::record_drop("relay");
            metrics::record_data_loss("relay_publish_data_loss");
            Ok(())
        }
    }
}
