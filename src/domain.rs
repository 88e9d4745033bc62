// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

/// Last emitted crossover signal for an instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    #[default]
    None,
    Buy,
    Sell,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self { SignalKind::None => "NONE", SignalKind::Buy => "BUY", SignalKind::Sell => "SELL" }
    }
    /// Order side opened on this signal. NONE never opens anything.
    pub fn side(&self) -> Option<Side> {
        match self { SignalKind::Buy => Some(Side::Buy), SignalKind::Sell => Some(Side::Sell), SignalKind::None => None }
    }
}

/// One price level of the book, price at index 0 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level { pub price: Decimal, pub size: Decimal }

/// Normalized order-book snapshot as it travels over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instrument: String,
    pub event_type: String,
    pub event_time: i64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopOfBook { pub bid: Decimal, pub ask: Decimal, pub mid: Decimal }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub event_type: String,
    pub instrument: String,
    pub event_time: i64,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus { Open, Closed }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub instrument: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub side: Side,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn open(instrument: &str, side: Side, price: Decimal, quantity: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            price,
            quantity,
            status: OrderStatus::Open,
            side,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable audit fact, one per emitted signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub instrument: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub price: Decimal,
    pub short_average: Decimal,
    pub long_average: Decimal,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Journal entries written by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Snapshot(SnapshotRecord),
    Signal(SignalRecord),
    Order(Order),
    OrderClosed { id: Uuid, instrument: String },
}
