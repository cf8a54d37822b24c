//! Distribution statistics over record metric values.
//!
//! Exported statistics are exact, computed from every value. Live snapshots use an
//! [`hdrhistogram`] per metric so percentiles stay cheap while the run is in progress.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Exact statistics over a set of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p1: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    /// Population standard deviation
    pub std: f64,
}

impl Distribution {
    /// `None` for an empty input.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let avg = sorted.iter().sum::<f64>() / count as f64;
        let variance = sorted.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / count as f64;

        Some(Self {
            count,
            avg,
            min: sorted[0],
            max: sorted[count - 1],
            p1: percentile(&sorted, 1.0),
            p5: percentile(&sorted, 5.0),
            p25: percentile(&sorted, 25.0),
            p50: percentile(&sorted, 50.0),
            p75: percentile(&sorted, 75.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            std: variance.sqrt(),
        })
    }

    /// Apply a unit conversion to every statistic.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            count: self.count,
            avg: f(self.avg),
            min: f(self.min),
            max: f(self.max),
            p1: f(self.p1),
            p5: f(self.p5),
            p25: f(self.p25),
            p50: f(self.p50),
            p75: f(self.p75),
            p90: f(self.p90),
            p95: f(self.p95),
            p99: f(self.p99),
            std: f(self.std),
        }
    }
}

/// Linear interpolation between closest ranks over sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Values are stored in thousandths so fractional metrics keep three decimals.
const SCALE: f64 = 1000.0;

/// Percentile approximation for a metric while the run is in progress.
#[derive(Debug, Clone)]
pub struct LiveHistogram {
    histogram: Option<Histogram<u64>>,
    sum: f64,
}

/// Live summary of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveQuantiles {
    pub count: u64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl LiveHistogram {
    pub fn new() -> Self {
        Self {
            histogram: None,
            sum: 0.0,
        }
    }

    /// Negative and non-finite values are ignored.
    pub fn record(&mut self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        if self.histogram.is_none() {
            // Three significant figures, auto-resizing
            self.histogram = Histogram::<u64>::new(3).ok();
        }
        let Some(histogram) = self.histogram.as_mut() else {
            return;
        };
        if histogram.record((value * SCALE).round() as u64).is_ok() {
            self.sum += value;
        }
    }

    pub fn quantiles(&self) -> Option<LiveQuantiles> {
        let histogram = self.histogram.as_ref()?;
        let count = histogram.len();
        if count == 0 {
            return None;
        }
        let at = |q: f64| histogram.value_at_quantile(q) as f64 / SCALE;
        Some(LiveQuantiles {
            count,
            avg: self.sum / count as f64,
            p50: at(0.50),
            p90: at(0.90),
            p99: at(0.99),
        })
    }
}

impl Default for LiveHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_matches_linear_interpolation() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let d = Distribution::from_values(&values).unwrap();

        assert_eq!(d.count, 100);
        assert_eq!(d.min, 1.0);
        assert_eq!(d.max, 100.0);
        assert_eq!(d.avg, 50.5);
        assert!((d.p50 - 50.5).abs() < 1e-9);
        assert!((d.p90 - 90.1).abs() < 1e-9);
        assert!((d.p99 - 99.01).abs() < 1e-9);
        assert!((d.std - 28.866_070_047_722_118).abs() < 1e-9);
    }

    #[test]
    fn test_single_value_distribution() {
        let d = Distribution::from_values(&[487.0]).unwrap();
        assert_eq!(d.p1, 487.0);
        assert_eq!(d.p99, 487.0);
        assert_eq!(d.std, 0.0);
    }

    #[test]
    fn test_empty_distribution() {
        assert!(Distribution::from_values(&[]).is_none());
    }

    #[test]
    fn test_live_histogram_tracks_percentiles() {
        let mut live = LiveHistogram::new();
        for v in 1..=1000 {
            live.record(f64::from(v));
        }
        live.record(f64::NAN);

        let q = live.quantiles().unwrap();
        assert_eq!(q.count, 1000);
        assert!((q.avg - 500.5).abs() < 1e-9);
        assert!((q.p50 - 500.0).abs() / 500.0 < 0.01);
        assert!((q.p99 - 990.0).abs() / 990.0 < 0.01);
    }
}
