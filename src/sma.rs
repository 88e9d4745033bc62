// ===============================
// src/sma.rs
// ===============================
use rust_decimal::Decimal;
use std::collections::VecDeque;

use crate::error::ValidationError;

/// Fixed-capacity FIFO of prices with a running sum.
///
/// The sum is maintained incrementally: add on push, subtract on evict.
/// Decimal arithmetic keeps it equal to the exact sum of the window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window: VecDeque<Decimal>,
    sum: Decimal,
    capacity: usize,
}

impl SlidingWindow {
    /// `None` for a zero capacity.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self { window: VecDeque::with_capacity(capacity + 1), sum: Decimal::ZERO, capacity })
    }

    /// Sum after pushing `price`, or `None` if it would overflow.
    pub fn next_sum(&self, price: Decimal) -> Option<Decimal> {
        let kept = match self.window.front() {
            Some(oldest) if self.window.len() == self.capacity => self.sum.checked_sub(*oldest)?,
            _ => self.sum,
        };
        kept.checked_add(price)
    }

    /// Push a price and return the average once the window is full.
    /// `Ok(None)` means not enough data yet, which is different from an average of zero.
    /// A price that would overflow the sum leaves the window untouched.
    pub fn add_price(&mut self, price: Decimal) -> Result<Option<Decimal>, ValidationError> {
        let sum = self.next_sum(price).ok_or(ValidationError::PriceOutOfRange)?;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(price);
        self.sum = sum;
        Ok(self.average())
    }

    pub fn average(&self) -> Option<Decimal> {
        if self.is_ready() {
            Some(self.sum / Decimal::from(self.capacity))
        } else {
            None
        }
    }

    pub fn is_ready(&self) -> bool { self.window.len() == self.capacity }
    pub fn len(&self) -> usize { self.window.len() }
    pub fn is_empty(&self) -> bool { self.window.is_empty() }
    pub fn capacity(&self) -> usize { self.capacity }
    pub fn sum(&self) -> Decimal { self.sum }
}
