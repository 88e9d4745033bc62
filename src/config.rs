// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : sma_crossover_bot — async SMA crossover signal engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT

Summary : Streams order-book depth (websocket/mock), relays snapshots over
          pub/sub, keeps short/long moving averages per instrument, emits
          crossover signals, keeps one open order per instrument, exposes
          Prometheus metrics and records JSONL events.
=============================================================================
*/
use dotenvy::dotenv;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Market data source
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Live,
}

impl FeedMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(FeedMode::Mock),
            "live" | "ws" | "websocket" => Some(FeedMode::Live),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self { FeedMode::Mock => "mock", FeedMode::Live => "live" }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // feed
    pub feed_mode: FeedMode,
    pub stream_url: String,
    pub symbols: Vec<String>, // mock feed only

    // relay
    pub broker_addr: String,
    pub relay_topic: String,
    pub relay_capacity: usize,

    // engine
    pub short_window: usize,
    pub long_window: usize,
    pub max_price_count: usize, // per-instrument queue
    pub order_qty: Decimal,

    // retry
    pub retry: RetryPolicy,

    // files/metrics
    pub metrics_port: u16,
    pub record_file: Option<String>,
}

/// Reads `.env` (if any) and the process environment.
pub fn load() -> Result<Args, ConfigError> {
    let _ = dotenv();
    from_lookup(|k| env::var(k).ok())
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

/// Build `Args` from any key lookup (environment in production, maps in tests).
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
    let feed_mode = match get("FEED_MODE") {
        None => FeedMode::Live,
        Some(v) => FeedMode::parse(&v).ok_or(ConfigError::Invalid { key: "FEED_MODE", value: v })?,
    };
    let stream_url = get("STREAM_URL")
        .or_else(|| get("WEB_SOCKET_URL"))
        .unwrap_or_else(|| "wss://stream.binance.com:9443/ws/btcusdt@depth".to_string());

    // SYMBOLS=BTCUSDT,ETHUSDT,SOLUSDT
    let symbols: Vec<String> = get("SYMBOLS")
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);

    let broker_addr = get("BROKER_ADDR").unwrap_or_else(|| "inproc://relay".to_string());
    let relay_topic = get("RELAY_TOPIC").unwrap_or_else(|| "order_book".to_string());
    let relay_capacity = parse_or(&get, "RELAY_CAPACITY", 4096usize)?;

    let short_window = parse_or(&get, "SHORT_WINDOW", 50usize)?;
    let long_window = parse_or(&get, "LONG_WINDOW", 200usize)?;
    if short_window == 0 || short_window >= long_window {
        return Err(ConfigError::Windows { short: short_window, long: long_window });
    }
    let max_price_count = parse_or(&get, "MAX_PRICE_COUNT", 200usize)?;
    let order_qty = parse_or(&get, "ORDER_QTY", Decimal::ONE)?;

    let retry = RetryPolicy {
        max_attempts: parse_or(&get, "CONNECT_MAX_ATTEMPTS", 5u32)?,
        delay: Duration::from_millis(parse_or(&get, "CONNECT_RETRY_DELAY_MS", 5000u64)?),
    };

    let metrics_port = parse_or(&get, "METRICS_PORT", 9898u16)?;
    let record_file = get("RECORD_FILE").filter(|s| !s.trim().is_empty());

    Ok(Args {
        feed_mode,
        stream_url,
        symbols,
        broker_addr,
        relay_topic,
        relay_capacity,
        short_window,
        long_window,
        max_price_count,
        order_qty,
        retry,
        metrics_port,
        record_file,
    })
}
