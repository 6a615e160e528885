//! Percentile statistics over raw value sets.
//!
//! Linear-interpolated percentiles; the summary shape is what both the
//! engine aggregation and the persisted output schema report, so "telescope"
//! numbers always come from the same computation.

use serde::{Deserialize, Serialize};

/// Compute a percentile over a sorted slice using linear interpolation.
///
/// `p` is in [0, 100]. Returns `None` for an empty slice.
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    if upper >= sorted.len() {
        return Some(sorted[sorted.len() - 1]);
    }
    Some(sorted[lower] * (1.0 - frac) + sorted[upper] * frac)
}

/// Percentile summary of a raw value set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileSummary {
    /// 10th percentile.
    pub p10: f64,
    /// 25th percentile.
    pub p25: f64,
    /// Median.
    pub p50: f64,
    /// 75th percentile.
    pub p75: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 95th percentile.
    pub p95: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Minimum observed value.
    pub min: f64,
    /// Maximum observed value.
    pub max: f64,
}

impl PercentileSummary {
    /// Summarize a value set. Returns `None` when no finite values remain.
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut xs: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
        if xs.is_empty() {
            return None;
        }
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let variance = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            p10: percentile(&xs, 10.0)?,
            p25: percentile(&xs, 25.0)?,
            p50: percentile(&xs, 50.0)?,
            p75: percentile(&xs, 75.0)?,
            p90: percentile(&xs, 90.0)?,
            p95: percentile(&xs, 95.0)?,
            mean,
            std: variance.sqrt(),
            min: xs[0],
            max: xs[xs.len() - 1],
        })
    }
}
