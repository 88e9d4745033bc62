// ===============================
// src/strategy.rs
// ===============================
//
// SMA crossover (trend-following)
//   Idea: short SMA crosses above long SMA -> BUY
//         short SMA crosses below long SMA -> SELL
//   A crossover is judged against the last emitted signal, not the
//   previous tick, so the same side is never emitted twice in a row.
//   Equal averages never signal.
//
use rust_decimal::Decimal;

use crate::domain::SignalKind;
use crate::error::ValidationError;
use crate::sma::SlidingWindow;

pub const REASON_BUY: &str = "short average crossed above long average";
pub const REASON_SELL: &str = "short average crossed below long average";
pub const REASON_NONE: &str = "no significant crossover";

/// Pure transition function of (short, long, last).
pub fn check_signal(short_avg: Decimal, long_avg: Decimal, last: SignalKind) -> (SignalKind, &'static str) {
    if short_avg > long_avg && last != SignalKind::Buy {
        (SignalKind::Buy, REASON_BUY)
    } else if short_avg < long_avg && last != SignalKind::Sell {
        (SignalKind::Sell, REASON_SELL)
    } else {
        (SignalKind::None, REASON_NONE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossover {
    pub short_avg: Decimal,
    pub long_avg: Decimal,
    pub signal: SignalKind,
    pub reason: &'static str,
}

impl Crossover {
    pub fn is_transition(&self) -> bool { self.signal != SignalKind::None }
}

/// Per-instrument windows plus the last emitted signal.
#[derive(Debug, Clone)]
pub struct CrossoverState {
    short: SlidingWindow,
    long: SlidingWindow,
    last: SignalKind,
}

impl CrossoverState {
    /// Caller guarantees `1 <= short_w < long_w`; `None` on a zero window.
    pub fn new(short_w: usize, long_w: usize) -> Option<Self> {
        Some(Self {
            short: SlidingWindow::new(short_w)?,
            long: SlidingWindow::new(long_w)?,
            last: SignalKind::None,
        })
    }

    /// Feed a mid price into both windows. `Ok(None)` while either is warming up.
    /// A price either window cannot hold is rejected before anything changes.
    /// Does not change the last signal; see [`CrossoverState::commit`].
    pub fn on_mid(&mut self, mid: Decimal) -> Result<Option<Crossover>, ValidationError> {
        if self.short.next_sum(mid).is_none() || self.long.next_sum(mid).is_none() {
            return Err(ValidationError::PriceOutOfRange);
        }
        let short_avg = self.short.add_price(mid)?;
        let long_avg = self.long.add_price(mid)?;
        let (Some(short_avg), Some(long_avg)) = (short_avg, long_avg) else {
            return Ok(None);
        };
        let (signal, reason) = check_signal(short_avg, long_avg, self.last);
        Ok(Some(Crossover { short_avg, long_avg, signal, reason }))
    }

    pub fn commit(&mut self, signal: SignalKind) {
        if signal != SignalKind::None {
            self.last = signal;
        }
    }

    pub fn last(&self) -> SignalKind { self.last }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn equal_averages_never_signal() {
        for last in [SignalKind::None, SignalKind::Buy, SignalKind::Sell] {
            assert_eq!(check_signal(dec!(3), dec!(3), last), (SignalKind::None, REASON_NONE));
        }
    }

    #[test]
    fn same_side_is_suppressed() {
        assert_eq!(check_signal(dec!(4), dec!(3), SignalKind::None).0, SignalKind::Buy);
        assert_eq!(check_signal(dec!(4), dec!(3), SignalKind::Buy).0, SignalKind::None);
        assert_eq!(check_signal(dec!(2), dec!(3), SignalKind::Buy), (SignalKind::Sell, REASON_SELL));
        assert_eq!(check_signal(dec!(2), dec!(3), SignalKind::Sell).0, SignalKind::None);
    }

    #[test]
    fn buy_fires_when_long_window_fills() {
        let mut st = CrossoverState::new(2, 4).unwrap();
        for p in [1, 2, 3] {
            assert_eq!(st.on_mid(Decimal::from(p)), Ok(None));
        }
        let x = st.on_mid(dec!(4)).unwrap().unwrap();
        assert_eq!((x.short_avg, x.long_avg), (dec!(3.5), dec!(2.5)));
        assert_eq!(x.signal, SignalKind::Buy);
        st.commit(x.signal);

        // still trending up: no repeat
        let x = st.on_mid(dec!(5)).unwrap().unwrap();
        assert_eq!(x.signal, SignalKind::None);

        // turn down hard enough for short < long
        st.on_mid(dec!(1)).unwrap();
        let x = st.on_mid(dec!(1)).unwrap().unwrap();
        assert_eq!(x.short_avg, dec!(1));
        assert_eq!(x.long_avg, dec!(2.75));
        assert_eq!(x.signal, SignalKind::Sell);
    }

    #[test]
    fn uncommitted_transition_is_offered_again() {
        let mut st = CrossoverState::new(1, 2).unwrap();
        st.on_mid(dec!(1)).unwrap();
        assert_eq!(st.on_mid(dec!(2)).unwrap().unwrap().signal, SignalKind::Buy);
        // not committed -> next up tick still reports BUY
        assert_eq!(st.on_mid(dec!(3)).unwrap().unwrap().signal, SignalKind::Buy);
        assert_eq!(st.last(), SignalKind::None);
    }

    #[test]
    fn out_of_range_mid_leaves_windows_untouched() {
        let mut st = CrossoverState::new(1, 2).unwrap();
        st.on_mid(Decimal::MAX).unwrap();
        assert_eq!(st.on_mid(Decimal::MAX), Err(ValidationError::PriceOutOfRange));
        // long window still holds only the first price
        assert_eq!(st.on_mid(dec!(-1)).unwrap().unwrap().long_avg, (Decimal::MAX - dec!(1)) / dec!(2));
    }

    proptest! {
        #[test]
        fn pure_and_never_repeats(
            pairs in proptest::collection::vec((0i64..50, 0i64..50), 1..200),
        ) {
            let mut last = SignalKind::None;
            let mut prev_emitted = SignalKind::None;
            for (s, l) in pairs {
                let (s, l) = (Decimal::from(s), Decimal::from(l));
                let a = check_signal(s, l, last);
                prop_assert_eq!(a, check_signal(s, l, last));
                if s == l {
                    prop_assert_eq!(a.0, SignalKind::None);
                }
                if a.0 != SignalKind::None {
                    prop_assert_ne!(a.0, prev_emitted);
                    prev_emitted = a.0;
                    last = a.0;
                }
            }
        }
    }
}
