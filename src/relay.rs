// ===============================
// src/relay.rs
// ===============================
//
// Pub/sub relay between the feed and the engine. Snapshots travel as JSON
// text, the same bytes an external broker would carry. A subscription
// only sees messages published after it was created.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use tracing::{error, info, warn};

use crate::domain::Snapshot;
use crate::error::RelayError;
use crate::metrics;
use crate::retry::{with_retry, RetryPolicy};

pub type Payload = Arc<str>;

#[async_trait]
pub trait Broker: Send + Sync {
    fn addr(&self) -> &str;
    async fn ping(&self) -> Result<(), RelayError>;
    /// Returns the number of subscribers reached (0 is not an error).
    async fn publish(&self, topic: &str, payload: Payload) -> Result<usize, RelayError>;
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Payload>;
}

/// In-process broker, one broadcast channel per topic.
pub struct LocalBroker {
    addr: String,
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Payload>>>,
}

impl LocalBroker {
    pub fn new(addr: impl Into<String>, capacity: usize) -> Self {
        Self { addr: addr.into(), capacity: capacity.max(1), topics: Mutex::new(HashMap::new()) }
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<Payload>, RelayError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| RelayError::Broker("topic table poisoned".into()))?;
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.clone())
    }

    /// Drop every topic; open subscriptions end.
    pub fn shutdown(&self) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.clear();
        }
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn addr(&self) -> &str { &self.addr }

    async fn ping(&self) -> Result<(), RelayError> {
        self.topics
            .lock()
            .map(|_| ())
            .map_err(|_| RelayError::Broker("topic table poisoned".into()))
    }

    async fn publish(&self, topic: &str, payload: Payload) -> Result<usize, RelayError> {
        // send only fails when nobody listens
        Ok(self.sender(topic)?.send(payload).unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Payload> {
        match self.sender(topic) {
            Ok(tx) => tx.subscribe(),
            // unreachable topic table: hand back an already-closed receiver
            Err(_) => broadcast::channel(1).1,
        }
    }
}

pub struct Relay {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    connected: Arc<AtomicBool>,
}

impl Relay {
    pub async fn connect(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Result<Self, RelayError> {
        let relay = Self { broker, policy, connected: Arc::new(AtomicBool::new(false)) };
        relay.reconnect().await?;
        Ok(relay)
    }

    async fn reconnect(&self) -> Result<(), RelayError> {
        self.set_connected(false);
        let broker = self.broker.clone();
        with_retry(&self.policy, "relay", || {
            let broker = broker.clone();
            async move { broker.ping().await }
        })
        .await?;
        info!(addr = %self.broker.addr(), "connected to broker");
        self.set_connected(true);
        Ok(())
    }

    fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
        metrics::set_connected("relay", up);
    }

    pub fn connected_flag(&self) -> Arc<AtomicBool> { self.connected.clone() }

    pub async fn ping(&self) -> Result<(), RelayError> {
        self.broker.ping().await
    }

    /// Encode and publish. A broker failure triggers one bounded reconnect
    /// and a single re-publish; only an exhausted retry budget is fatal.
    pub async fn publish(&self, topic: &str, snapshot: &Snapshot) -> Result<usize, RelayError> {
        let payload: Payload = serde_json::to_string(snapshot)?.into();
        match self.broker.publish(topic, payload.clone()).await {
            Ok(n) => Ok(n),
            Err(e) => {
                error!(?e, %topic, "publish failed, reconnecting broker");
                metrics::record_error("relay_publish_error");
                self.reconnect().await?;
                self.broker.publish(topic, payload).await
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        Subscription { topic: topic.to_string(), rx: self.broker.subscribe(topic) }
    }
}

pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Payload>,
}

impl Subscription {
    /// Next decodable snapshot; `None` once the broker side is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => {
                    if let Some(snap) = self.decode(&payload) {
                        return Some(snap);
                    }
                }
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Like `next`, but only what is already buffered; `None` when empty.
    pub fn try_next(&mut self) -> Option<Snapshot> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => {
                    if let Some(snap) = self.decode(&payload) {
                        return Some(snap);
                    }
                }
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn decode(&self, payload: &str) -> Option<Snapshot> {
        match serde_json::from_str::<Snapshot>(payload) {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!(?e, topic = %self.topic, "dropping malformed relay payload");
                metrics::record_error("relay_unmarshal_error");
                metrics::record_drop("relay_decode");
                None
            }
        }
    }

    fn lagged(&self, n: u64) {
        warn!(skipped = n, topic = %self.topic, "subscriber lagged");
        metrics::record_data_loss("relay_lagged");
        metrics::DROPPED.with_label_values(&["relay_lagged"]).inc_by(n);
        metrics::sweep_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Level;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn snap(instrument: &str) -> Snapshot {
        Snapshot {
            instrument: instrument.into(),
            event_type: "depthUpdate".into(),
            event_time: 1,
            bids: vec![Level { price: dec!(10), size: dec!(1) }],
            asks: vec![Level { price: dec!(11), size: dec!(1) }],
            latency_id: Some("abc".into()),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, delay: Duration::from_millis(1) }
    }

    #[tokio::test]
    async fn subscriber_receives_published_snapshot() {
        let broker = Arc::new(LocalBroker::new("inproc://test", 16));
        let relay = Relay::connect(broker, fast()).await.unwrap();
        let mut sub = relay.subscribe("order_book");
        assert_eq!(relay.publish("order_book", &snap("BTC")).await.unwrap(), 1);
        assert_eq!(sub.next().await.unwrap(), snap("BTC"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let relay = Relay::connect(Arc::new(LocalBroker::new("inproc://test", 16)), fast()).await.unwrap();
        assert_eq!(relay.publish("order_book", &snap("BTC")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let broker = Arc::new(LocalBroker::new("inproc://test", 16));
        let relay = Relay::connect(broker.clone(), fast()).await.unwrap();
        let mut sub = relay.subscribe("order_book");
        broker.publish("order_book", Arc::from("{not json")).await.unwrap();
        relay.publish("order_book", &snap("ETH")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().instrument, "ETH");
    }

    #[tokio::test]
    async fn subscription_ends_on_broker_shutdown() {
        let broker = Arc::new(LocalBroker::new("inproc://test", 16));
        let relay = Relay::connect(broker.clone(), fast()).await.unwrap();
        let mut sub = relay.subscribe("order_book");
        broker.shutdown();
        assert!(sub.next().await.is_none());
    }

    struct FlakyBroker {
        inner: LocalBroker,
        ping_failures: AtomicU32,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        fn addr(&self) -> &str { self.inner.addr() }
        async fn ping(&self) -> Result<(), RelayError> {
            let left = self.ping_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.ping_failures.store(left - 1, Ordering::SeqCst);
                return Err(RelayError::Broker("refused".into()));
            }
            Ok(())
        }
        async fn publish(&self, topic: &str, payload: Payload) -> Result<usize, RelayError> {
            self.inner.publish(topic, payload).await
        }
        fn subscribe(&self, topic: &str) -> broadcast::Receiver<Payload> {
            self.inner.subscribe(topic)
        }
    }

    #[tokio::test]
    async fn connect_retries_then_succeeds() {
        let broker = Arc::new(FlakyBroker { inner: LocalBroker::new("flaky", 4), ping_failures: AtomicU32::new(2) });
        let relay = Relay::connect(broker, fast()).await.unwrap();
        assert!(relay.connected_flag().load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn connect_gives_up_after_bound() {
        let broker = Arc::new(FlakyBroker { inner: LocalBroker::new("flaky", 4), ping_failures: AtomicU32::new(10) });
        let err = Relay::connect(broker, fast()).await.err().unwrap();
        match err {
            RelayError::Fatal(x) => assert_eq!(x.attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Healthy until `down` is set; then publishes and pings fail as scripted.
    #[derive(Default)]
    struct FailingPublishBroker {
        inner: Option<LocalBroker>,
        publish_failures: AtomicU32,
        broker_down: AtomicBool,
        publishes: AtomicU32,
        pings: AtomicU32,
    }

    #[async_trait]
    impl Broker for FailingPublishBroker {
        fn addr(&self) -> &str { "failing" }
        async fn ping(&self) -> Result<(), RelayError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.broker_down.load(Ordering::SeqCst) {
                return Err(RelayError::Broker("refused".into()));
            }
            Ok(())
        }
        async fn publish(&self, topic: &str, payload: Payload) -> Result<usize, RelayError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            let left = self.publish_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.publish_failures.store(left - 1, Ordering::SeqCst);
                return Err(RelayError::Broker("connection reset".into()));
            }
            match &self.inner {
                Some(b) => b.publish(topic, payload).await,
                None => Ok(0),
            }
        }
        fn subscribe(&self, topic: &str) -> broadcast::Receiver<Payload> {
            match &self.inner {
                Some(b) => b.subscribe(topic),
                None => broadcast::channel(1).1,
            }
        }
    }

    #[tokio::test]
    async fn publish_failure_reconnects_and_republishes_once() {
        let broker = Arc::new(FailingPublishBroker {
            inner: Some(LocalBroker::new("inproc://test", 4)),
            ..Default::default()
        });
        let relay = Relay::connect(broker.clone(), fast()).await.unwrap();
        let mut sub = relay.subscribe("order_book");
        broker.publish_failures.store(1, Ordering::SeqCst);
        let pings_before = broker.pings.load(Ordering::SeqCst);

        assert_eq!(relay.publish("order_book", &snap("BTC")).await.unwrap(), 1);
        assert_eq!(broker.publishes.load(Ordering::SeqCst), 2);
        assert_eq!(broker.pings.load(Ordering::SeqCst), pings_before + 1);
        assert!(relay.connected_flag().load(Ordering::Relaxed));
        assert_eq!(sub.next().await.unwrap(), snap("BTC"));
    }

    #[tokio::test]
    async fn publish_with_broker_gone_is_fatal_once() {
        let broker = Arc::new(FailingPublishBroker::default());
        let relay = Relay::connect(broker.clone(), fast()).await.unwrap();
        broker.publish_failures.store(u32::MAX, Ordering::SeqCst);
        broker.broker_down.store(true, Ordering::SeqCst);
        let pings_before = broker.pings.load(Ordering::SeqCst);

        match relay.publish("order_book", &snap("BTC")).await {
            Err(RelayError::Fatal(x)) => assert_eq!(x.attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        // no republish after the retry budget is spent
        assert_eq!(broker.publishes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pings.load(Ordering::SeqCst), pings_before + 3);
        assert!(!relay.connected_flag().load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn try_next_returns_only_buffered() {
        let broker = Arc::new(LocalBroker::new("inproc://test", 8));
        let relay = Relay::connect(broker, fast()).await.unwrap();
        let mut sub = relay.subscribe("order_book");
        assert!(sub.try_next().is_none());
        relay.publish("order_book", &snap("BTC")).await.unwrap();
        relay.publish("order_book", &snap("ETH")).await.unwrap();
        assert_eq!(sub.try_next().unwrap().instrument, "BTC");
        assert_eq!(sub.try_next().unwrap().instrument, "ETH");
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_to_newest() {
        let broker = Arc::new(LocalBroker::new("inproc://test", 2));
        let relay = Relay::connect(broker, fast()).await.unwrap();
        let mut sub = relay.subscribe("order_book");
        for i in 0..20 {
            let mut s = snap("BTC");
            s.event_time = i;
            relay.publish("order_book", &s).await.unwrap();
        }
        assert_eq!(sub.next().await.unwrap().event_time, 18);
        assert_eq!(sub.next().await.unwrap().event_time, 19);
    }
}
