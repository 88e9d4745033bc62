// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("window sizes must satisfy 1 <= short < long (short={short}, long={long})")]
    Windows { short: usize, long: usize },
}

/// Transient transport failures. The driving loop reconnects on both.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Bounded retry budget spent on a required dependency.
#[derive(Debug, Error)]
#[error("{target}: giving up after {attempts} attempts (last error: {last_error})")]
pub struct RetryExhausted {
    pub target: String,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot has no instrument")]
    MissingInstrument,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("snapshot has no bids")]
    EmptyBids,
    #[error("snapshot has no asks")]
    EmptyAsks,
    #[error("price out of range")]
    PriceOutOfRange,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("order {0} not found")]
    OrderNotFound(uuid::Uuid),
    #[error("store closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker error: {0}")]
    Broker(String),
    #[error(transparent)]
    Fatal(#[from] RetryExhausted),
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("open order lookup failed: {0}")]
    Lookup(StoreError),
    #[error("closing order {id} failed: {source}")]
    Close { id: uuid::Uuid, source: StoreError },
    #[error("opening order failed: {0}")]
    Open(StoreError),
    #[error("saving signal record failed: {0}")]
    Audit(StoreError),
}

impl PositionError {
    /// Whether the signal counts as emitted despite the failure.
    /// Lookup/close failures leave the previous position intact, so the
    /// transition is retried on the next tick instead.
    pub fn commits_signal(&self) -> bool {
        matches!(self, PositionError::Open(_) | PositionError::Audit(_))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fatal: {0}")]
    Fatal(#[from] RetryExhausted),
    #[error("relay: {0}")]
    Relay(RelayError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// An exhausted relay retry budget is fatal like any other.
    pub fn from_relay(e: RelayError) -> Self {
        match e {
            RelayError::Fatal(x) => PipelineError::Fatal(x),
            other => PipelineError::Relay(other),
        }
    }
}
