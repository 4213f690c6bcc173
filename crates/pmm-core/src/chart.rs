//! Bounded ring of recent ticker samples.
//!
//! The strategy and spread estimator both read the chart; it is
//! persisted inside the journal so a restarted trader keeps its
//! price history.

use crate::Ticker;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 1440;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    samples: VecDeque<Ticker>,
    capacity: usize,
}

impl Chart {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: Ticker) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&Ticker> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ticker> {
        self.samples.iter()
    }

    /// The newest `n` samples, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &Ticker> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip)
    }
}

impl Default for Chart {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Price;
    use rust_decimal_macros::dec;

    fn tick(last: rust_decimal::Decimal, t: i64) -> Ticker {
        Ticker::new(Price::new(last), Price::new(last), Price::new(last), t)
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut chart = Chart::new(3);
        for i in 0..5 {
            chart.push(tick(dec!(100) + rust_decimal::Decimal::from(i), i));
        }
        assert_eq!(chart.len(), 3);
        assert_eq!(chart.iter().next().unwrap().time_ms, 2);
        assert_eq!(chart.last().unwrap().time_ms, 4);
    }

    #[test]
    fn test_tail_shorter_than_window() {
        let mut chart = Chart::new(10);
        chart.push(tick(dec!(1), 0));
        chart.push(tick(dec!(2), 1));
        assert_eq!(chart.tail(5).count(), 2);
        assert_eq!(chart.tail(1).next().unwrap().time_ms, 1);
    }
}
