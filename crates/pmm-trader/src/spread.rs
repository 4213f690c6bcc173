//! Smoothed spread estimation.
//!
//! The estimator runs as a deferred stats job, never on the trading
//! path; the result flows back to the trader through a shared
//! [`SpreadCell`] it reads at the start of the next cycle.

use parking_lot::Mutex;
use pmm_core::Chart;
use std::sync::Arc;

/// Shared slot for the latest smoothed spread fraction.
#[derive(Clone, Default)]
pub struct SpreadCell(Arc<Mutex<f64>>);

impl SpreadCell {
    pub fn new(initial: f64) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> f64 {
        *self.0.lock()
    }

    pub fn set(&self, value: f64) {
        *self.0.lock() = value;
    }
}

/// Rolling log-return volatility, EMA-smoothed.
#[derive(Debug, Clone, Copy)]
pub struct SpreadEstimator {
    /// Number of chart samples the deviation is computed over.
    pub window: usize,
    /// EMA factor blending the new raw estimate into the old one.
    pub alpha: f64,
}

impl SpreadEstimator {
    pub fn new(window: usize, alpha: f64) -> Self {
        Self {
            window: window.max(2),
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Raw spread: standard deviation of log returns over the chart
    /// tail. Returns 0 when there are not enough samples.
    pub fn raw(&self, chart: &Chart) -> f64 {
        let prices: Vec<f64> = chart
            .tail(self.window)
            .map(|t| t.last.to_f64())
            .filter(|p| *p > 0.0)
            .collect();
        if prices.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        var.sqrt()
    }

    /// Blend a fresh raw estimate into `prev` and apply `floor`.
    pub fn estimate(&self, chart: &Chart, prev: f64, floor: f64) -> f64 {
        let raw = self.raw(chart);
        let blended = if prev > 0.0 {
            prev + self.alpha * (raw - prev)
        } else {
            raw
        };
        blended.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm_core::{Price, Ticker};
    use rust_decimal::Decimal;

    fn chart_of(prices: &[f64]) -> Chart {
        let mut chart = Chart::new(1024);
        for (i, p) in prices.iter().enumerate() {
            let d = Decimal::from_f64_retain(*p).unwrap();
            chart.push(Ticker::new(
                Price::new(d),
                Price::new(d),
                Price::new(d),
                i as i64,
            ));
        }
        chart
    }

    #[test]
    fn test_flat_chart_hits_floor() {
        let est = SpreadEstimator::new(50, 0.15);
        let chart = chart_of(&[100.0; 60]);
        assert_eq!(est.raw(&chart), 0.0);
        let spread = est.estimate(&chart, 0.0, 0.002);
        assert_eq!(spread, 0.002);
    }

    #[test]
    fn test_volatile_chart_raises_spread() {
        let est = SpreadEstimator::new(50, 0.15);
        let mut prices = Vec::new();
        for i in 0..60 {
            prices.push(if i % 2 == 0 { 100.0 } else { 102.0 });
        }
        let chart = chart_of(&prices);
        let raw = est.raw(&chart);
        assert!(raw > 0.005, "raw spread {raw} too small");
    }

    #[test]
    fn test_ema_moves_toward_raw() {
        let est = SpreadEstimator::new(50, 0.5);
        let chart = chart_of(&[100.0; 60]); // raw = 0
        let smoothed = est.estimate(&chart, 0.01, 0.0);
        assert!((smoothed - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_too_few_samples() {
        let est = SpreadEstimator::new(50, 0.15);
        let chart = chart_of(&[100.0]);
        assert_eq!(est.raw(&chart), 0.0);
    }
}
