// ===============================
// src/book.rs
// ===============================
//
// Snapshot normalizer. Accepts the documented long field names and the
// short Binance depth-stream ones:
//   {"e":"depthUpdate","E":1700000000000,"s":"BNBUSDT",
//    "b":[["25.35","31.2"]],"a":[["25.36","40.6"]]}
//
// Prices are lossy: an unparsable level price becomes 0 instead of
// failing the whole snapshot.
//
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::domain::{Level, Snapshot, TopOfBook};
use crate::error::{ParseError, ValidationError};

#[derive(Debug, Deserialize)]
struct RawDepth {
    #[serde(rename = "e", alias = "event_type", default)]
    event_type: String,
    #[serde(rename = "E", alias = "event_time", default)]
    event_time: i64,
    #[serde(rename = "s", alias = "instrument", alias = "symbol", default)]
    instrument: String,
    #[serde(rename = "b", alias = "bids", default)]
    bids: Vec<Vec<Value>>,
    #[serde(rename = "a", alias = "asks", default)]
    asks: Vec<Vec<Value>>,
}

pub fn parse_decimal(v: &Value) -> Decimal {
    let parsed = match v {
        Value::String(s) => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim())),
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s).or_else(|_| Decimal::from_scientific(&s))
        }
        _ => return Decimal::ZERO,
    };
    parsed.unwrap_or(Decimal::ZERO)
}

fn to_levels(raw: &[Vec<Value>]) -> Vec<Level> {
    raw.iter()
        .map(|lvl| Level {
            price: lvl.first().map(parse_decimal).unwrap_or(Decimal::ZERO),
            size: lvl.get(1).map(parse_decimal).unwrap_or(Decimal::ZERO),
        })
        .collect()
}

pub fn normalize(raw: &str) -> Result<Snapshot, ParseError> {
    let depth: RawDepth = serde_json::from_str(raw)?;
    if depth.instrument.trim().is_empty() {
        return Err(ParseError::MissingInstrument);
    }
    Ok(Snapshot {
        instrument: depth.instrument.trim().to_ascii_uppercase(),
        event_type: depth.event_type,
        event_time: depth.event_time,
        bids: to_levels(&depth.bids),
        asks: to_levels(&depth.asks),
        latency_id: None,
    })
}

/// Highest bid; ties keep the first level in input order.
pub fn best_bid(levels: &[Level]) -> Option<&Level> {
    let mut best: Option<&Level> = None;
    for lvl in levels {
        if best.map_or(true, |b| lvl.price > b.price) {
            best = Some(lvl);
        }
    }
    best
}

/// Lowest ask; ties keep the first level in input order.
pub fn best_ask(levels: &[Level]) -> Option<&Level> {
    let mut best: Option<&Level> = None;
    for lvl in levels {
        if best.map_or(true, |b| lvl.price < b.price) {
            best = Some(lvl);
        }
    }
    best
}

/// `None` when `bid + ask` does not fit in a Decimal.
pub fn mid_price(bid: Decimal, ask: Decimal) -> Option<Decimal> {
    bid.checked_add(ask)?.checked_div(Decimal::TWO)
}

impl Snapshot {
    /// Best bid/ask and mid. Either side empty rejects the snapshot.
    pub fn top_of_book(&self) -> Result<TopOfBook, ValidationError> {
        let bid = best_bid(&self.bids).ok_or(ValidationError::EmptyBids)?.price;
        let ask = best_ask(&self.asks).ok_or(ValidationError::EmptyAsks)?.price;
        let mid = mid_price(bid, ask).ok_or(ValidationError::PriceOutOfRange)?;
        Ok(TopOfBook { bid, ask, mid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lvl(price: Decimal, size: Decimal) -> Level {
        Level { price, size }
    }

    #[test]
    fn best_levels_and_mid() {
        let raw = r#"{"instrument":"btcusdt","event_type":"depthUpdate","event_time":1,
            "bids":[["10","1"],["12","1"],["11","1"]],
            "asks":[["9","1"],["7","1"],["8","1"]]}"#;
        let snap = normalize(raw).unwrap();
        assert_eq!(snap.instrument, "BTCUSDT");
        let top = snap.top_of_book().unwrap();
        assert_eq!(top.bid, dec!(12));
        assert_eq!(top.ask, dec!(7));
        assert_eq!(top.mid, dec!(9.5));
    }

    #[test]
    fn accepts_binance_short_names() {
        let raw = r#"{"e":"depthUpdate","E":1700000000000,"s":"BNBUSDT","U":1,"u":2,
            "b":[["25.35190000","31.21000000"]],"a":[["25.36520000","40.66000000"]]}"#;
        let snap = normalize(raw).unwrap();
        assert_eq!(snap.event_type, "depthUpdate");
        assert_eq!(snap.event_time, 1_700_000_000_000);
        assert_eq!(snap.bids, vec![lvl(dec!(25.3519), dec!(31.21))]);
    }

    #[test]
    fn ties_keep_first_occurrence() {
        let bids = vec![lvl(dec!(5), dec!(1)), lvl(dec!(5), dec!(2))];
        assert_eq!(best_bid(&bids).unwrap().size, dec!(1));
        let asks = vec![lvl(dec!(6), dec!(3)), lvl(dec!(6), dec!(4))];
        assert_eq!(best_ask(&asks).unwrap().size, dec!(3));
    }

    #[test]
    fn unparsable_price_is_zero() {
        let raw = r#"{"s":"X","b":[["abc","1"],[10.5,"2"]],"a":[[]]}"#;
        let snap = normalize(raw).unwrap();
        assert_eq!(snap.bids[0].price, Decimal::ZERO);
        assert_eq!(snap.bids[1].price, dec!(10.5));
        assert_eq!(snap.asks[0].price, Decimal::ZERO);
    }

    #[test]
    fn empty_side_is_rejected() {
        let snap = normalize(r#"{"s":"X","b":[],"a":[["1","1"]]}"#).unwrap();
        assert_eq!(snap.top_of_book(), Err(ValidationError::EmptyBids));
        let snap = normalize(r#"{"s":"X","b":[["1","1"]]}"#).unwrap();
        assert_eq!(snap.top_of_book(), Err(ValidationError::EmptyAsks));
    }

    #[test]
    fn huge_prices_are_rejected_not_summed() {
        let raw = r#"{"s":"BTCUSDT","E":1,
            "b":[["79228162514264337593543950335","1"]],"a":[["79228162514264337593543950335","1"]]}"#;
        let snap = normalize(raw).unwrap();
        assert_eq!(snap.top_of_book(), Err(ValidationError::PriceOutOfRange));
        assert_eq!(mid_price(Decimal::MAX, Decimal::ZERO), Some(Decimal::MAX / Decimal::TWO));
    }

    #[test]
    fn malformed_or_anonymous_messages_fail() {
        assert!(matches!(normalize("not json"), Err(ParseError::Json(_))));
        assert!(matches!(normalize(r#"{"result":null,"id":1}"#), Err(ParseError::MissingInstrument)));
    }
}
