// ===============================
// tests/pipeline.rs
// ===============================
//
// Feed -> relay -> dispatcher -> workers -> store, with a scripted feed.
//
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sma_crossover_bot::domain::{Event, OrderStatus, Side, SignalKind};
use sma_crossover_bot::engine::{run_dispatch, EngineConfig, EngineCtx, Registry};
use sma_crossover_bot::error::FeedError;
use sma_crossover_bot::feed::{run_ingest, Connector, FeedAdapter, MessageStream};
use sma_crossover_bot::positions::PositionManager;
use sma_crossover_bot::relay::{LocalBroker, Relay};
use sma_crossover_bot::retry::RetryPolicy;
use sma_crossover_bot::store::{MemoryStore, Store};

type Script = Vec<Result<String, ()>>;

/// Connection k serves `scripts[k]`, then stays silent.
struct ScriptedConnector {
    calls: Arc<AtomicU32>,
    scripts: Vec<Script>,
}

struct ScriptedStream {
    items: VecDeque<Result<String, ()>>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Stream = ScriptedStream;
    async fn connect(&self, _endpoint: &str) -> Result<ScriptedStream, FeedError> {
        let k = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(ScriptedStream { items: self.scripts.get(k).cloned().unwrap_or_default().into() })
    }
}

#[async_trait]
impl MessageStream for ScriptedStream {
    async fn receive(&mut self) -> Result<String, FeedError> {
        match self.items.pop_front() {
            Some(Ok(s)) => Ok(s),
            Some(Err(())) => Err(FeedError::ConnectionLost("scripted drop".into())),
            None => std::future::pending().await,
        }
    }
}

/// Depth message whose mid is exactly `mid`.
fn depth(symbol: &str, t: i64, mid: i64) -> Result<String, ()> {
    Ok(serde_json::json!({
        "e": "depthUpdate",
        "E": t,
        "s": symbol,
        "b": [[format!("{}.5", mid - 1), "1"], ["0.1", "3"]],
        "a": [[format!("{mid}.5"), "1"], [format!("{}", mid + 100), "3"]],
    })
    .to_string())
}

fn fast() -> RetryPolicy {
    RetryPolicy { max_attempts: 3, delay: Duration::from_millis(1) }
}

async fn wait_for_snapshots(store: &MemoryStore, n: usize) {
    for _ in 0..500 {
        if store.snapshot_count().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("only {} of {n} snapshots persisted", store.snapshot_count().await);
}

#[tokio::test]
async fn crossover_flips_are_persisted_per_instrument() {
    // BTC rises then falls: BUY at t=4, SELL at t=7.
    // ETH falls then jumps: SELL at t=4, BUY at t=7.
    let btc = [1, 2, 3, 4, 5, 6, 1];
    let eth = [6, 5, 4, 3, 2, 1, 10];

    let mut first: Script = vec![Ok("not json".into())];
    let mut second: Script = Vec::new();
    for (i, (b, e)) in btc.iter().zip(eth.iter()).enumerate() {
        let t = i as i64 + 1;
        let conn = if t <= 3 { &mut first } else { &mut second };
        conn.push(depth("btcusdt", t, *b));
        conn.push(depth("ETHUSDT", t, *e));
    }
    // empty bid side: dropped before it reaches the averages
    second.insert(0, Ok(r#"{"s":"BTCUSDT","E":99,"b":[],"a":[["1","1"]]}"#.into()));
    first.push(Err(()));

    let calls = Arc::new(AtomicU32::new(0));
    let adapter = FeedAdapter::new(ScriptedConnector { calls: calls.clone(), scripts: vec![first, second] }, "ws://test", fast());

    let store = Arc::new(MemoryStore::new());
    let (journal_tx, mut journal_rx) = mpsc::channel::<Event>(256);
    let ctx = EngineCtx {
        store: store.clone(),
        positions: PositionManager::new(store.clone(), dec!(1), Some(journal_tx.clone())),
        journal: Some(journal_tx),
        config: EngineConfig { short_window: 2, long_window: 4, queue_capacity: 8 },
    };

    let relay = Relay::connect(Arc::new(LocalBroker::new("inproc://test", 256)), fast()).await.unwrap();
    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(run_dispatch(relay.subscribe("order_book"), Registry::new(ctx), cancel.clone()));

    let ingest = run_ingest(&adapter, &relay, "order_book", cancel.clone());
    let stop = async {
        wait_for_snapshots(&store, 14).await;
        cancel.cancel();
    };
    let (res, _) = tokio::join!(ingest, stop);
    assert!(res.is_ok());
    dispatcher.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.snapshot_count().await, 14);

    let btc_orders = store.orders("BTCUSDT").await;
    assert_eq!(btc_orders.len(), 2);
    assert_eq!((btc_orders[0].side, btc_orders[0].status, btc_orders[0].price), (Side::Buy, OrderStatus::Closed, dec!(4)));
    assert_eq!((btc_orders[1].side, btc_orders[1].status, btc_orders[1].price), (Side::Sell, OrderStatus::Open, dec!(1)));

    let eth_orders = store.orders("ETHUSDT").await;
    assert_eq!(eth_orders.len(), 2);
    assert_eq!((eth_orders[0].side, eth_orders[0].status), (Side::Sell, OrderStatus::Closed));
    assert_eq!((eth_orders[1].side, eth_orders[1].status, eth_orders[1].price), (Side::Buy, OrderStatus::Open, dec!(10)));

    let kinds: Vec<SignalKind> = store.signals("ETHUSDT").await.iter().map(|s| s.kind).collect();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.contains(&SignalKind::Sell) && kinds.contains(&SignalKind::Buy));

    let mut journaled = 0;
    while let Ok(ev) = journal_rx.try_recv() {
        if let Event::Order(o) = ev {
            assert!(o.instrument == "BTCUSDT" || o.instrument == "ETHUSDT");
            journaled += 1;
        }
    }
    assert_eq!(journaled, 4);
    assert!(store.get_last_open_order("SOLUSDT").await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_connect_budget_ends_ingest_with_error() {
    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        type Stream = ScriptedStream;
        async fn connect(&self, endpoint: &str) -> Result<ScriptedStream, FeedError> {
            Err(FeedError::Connect { endpoint: endpoint.into(), reason: "refused".into() })
        }
    }

    let adapter = FeedAdapter::new(Refusing, "ws://nowhere", fast());
    let relay = Relay::connect(Arc::new(LocalBroker::new("inproc://test", 16)), fast()).await.unwrap();
    let err = run_ingest(&adapter, &relay, "order_book", CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("fatal"));
}
