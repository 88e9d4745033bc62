// ===============================
// src/store.rs
// ===============================
//
// Persistence port. Delivery upstream is at-least-once, so every write is
// an upsert on a natural key and replaying the same fact is harmless.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Order, OrderStatus, SignalKind, SignalRecord, SnapshotRecord};
use crate::error::StoreError;

#[async_trait]
pub trait Store: Send + Sync {
    async fn save_snapshot(&self, snap: &SnapshotRecord) -> Result<i64, StoreError>;
    async fn save_order(&self, order: &Order) -> Result<(), StoreError>;
    /// Most recently created open order of `instrument`.
    async fn get_last_open_order(&self, instrument: &str) -> Result<Option<Order>, StoreError>;
    async fn close_order(&self, id: Uuid) -> Result<(), StoreError>;
    async fn save_signal(&self, signal: &SignalRecord) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
    async fn close(&self);
}

#[derive(Default)]
struct Tables {
    snapshots: HashMap<(String, i64), (i64, SnapshotRecord)>,
    next_snapshot_id: i64,
    orders: HashMap<Uuid, Order>,
    // insertion sequence, breaks created_at ties
    order_seq: HashMap<Uuid, u64>,
    next_order_seq: u64,
    signals: HashMap<(String, DateTime<Utc>, SignalKind), SignalRecord>,
    closed: bool,
}

impl Tables {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed { Err(StoreError::Closed) } else { Ok(()) }
    }
}

/// In-process store with the same upsert semantics as the SQL schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn orders(&self, instrument: &str) -> Vec<Order> {
        let t = self.tables.lock().await;
        let mut out: Vec<Order> = t.orders.values().filter(|o| o.instrument == instrument).cloned().collect();
        out.sort_by_key(|o| (o.created_at, t.order_seq.get(&o.id).copied().unwrap_or(0)));
        out
    }

    pub async fn signals(&self, instrument: &str) -> Vec<SignalRecord> {
        let t = self.tables.lock().await;
        let mut out: Vec<SignalRecord> =
            t.signals.values().filter(|s| s.instrument == instrument).cloned().collect();
        out.sort_by_key(|s| s.timestamp);
        out
    }

    pub async fn snapshot_count(&self) -> usize {
        self.tables.lock().await.snapshots.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_snapshot(&self, snap: &SnapshotRecord) -> Result<i64, StoreError> {
        let mut t = self.tables.lock().await;
        t.check_open()?;
        let key = (snap.instrument.clone(), snap.event_time);
        if let Some((id, row)) = t.snapshots.get_mut(&key) {
            *row = snap.clone();
            return Ok(*id);
        }
        t.next_snapshot_id += 1;
        let id = t.next_snapshot_id;
        t.snapshots.insert(key, (id, snap.clone()));
        Ok(id)
    }

    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.check_open()?;
        if !t.order_seq.contains_key(&order.id) {
            t.next_order_seq += 1;
            let seq = t.next_order_seq;
            t.order_seq.insert(order.id, seq);
        }
        t.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_last_open_order(&self, instrument: &str) -> Result<Option<Order>, StoreError> {
        let t = self.tables.lock().await;
        t.check_open()?;
        let last = t
            .orders
            .values()
            .filter(|o| o.instrument == instrument && o.status == OrderStatus::Open)
            .max_by_key(|o| (o.created_at, t.order_seq.get(&o.id).copied().unwrap_or(0)))
            .cloned();
        Ok(last)
    }

    async fn close_order(&self, id: Uuid) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.check_open()?;
        let order = t.orders.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;
        // closing twice is a no-op
        if order.status == OrderStatus::Open {
            order.status = OrderStatus::Closed;
            order.updated_at = Utc::now();
        }
        debug!(%id, "order closed");
        Ok(())
    }

    async fn save_signal(&self, signal: &SignalRecord) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.check_open()?;
        let key = (signal.instrument.clone(), signal.timestamp, signal.kind);
        t.signals.insert(key, signal.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.tables.lock().await.check_open()
    }

    async fn close(&self) {
        self.tables.lock().await.closed = true;
    }
}

/// `MemoryStore` with switchable write failures.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_lookup: std::sync::atomic::AtomicBool,
    pub fail_close: std::sync::atomic::AtomicBool,
    pub fail_save_order: std::sync::atomic::AtomicBool,
    pub fail_save_signal: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FaultyStore {
    fn failing(flag: &std::sync::atomic::AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{what} failed")));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl Store for FaultyStore {
    async fn save_snapshot(&self, s: &SnapshotRecord) -> Result<i64, StoreError> { self.inner.save_snapshot(s).await }
    async fn save_order(&self, o: &Order) -> Result<(), StoreError> {
        Self::failing(&self.fail_save_order, "insert order")?;
        self.inner.save_order(o).await
    }
    async fn get_last_open_order(&self, i: &str) -> Result<Option<Order>, StoreError> {
        Self::failing(&self.fail_lookup, "select order")?;
        self.inner.get_last_open_order(i).await
    }
    async fn close_order(&self, id: Uuid) -> Result<(), StoreError> {
        Self::failing(&self.fail_close, "update order")?;
        self.inner.close_order(id).await
    }
    async fn save_signal(&self, s: &SignalRecord) -> Result<(), StoreError> {
        Self::failing(&self.fail_save_signal, "insert signal")?;
        self.inner.save_signal(s).await
    }
    async fn ping(&self) -> Result<(), StoreError> { self.inner.ping().await }
    async fn close(&self) { self.inner.close().await }
}
