//! Diameter statistics.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Diameter of the circle with the same area
pub fn equivalent_diameter(area_px: f64) -> f64 {
    (4.0 * area_px / PI).sqrt()
}

/// Summary over a diameter distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Percentile of an ascending slice with linear interpolation between ranks
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (q / 100.0).clamp(0.0, 1.0) * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Summarize an ascending slice; `None` when it is empty
pub fn summarize(sorted: &[f64]) -> Option<SummaryStats> {
    let (&min, &max) = (sorted.first()?, sorted.last()?);
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    Some(SummaryStats {
        p10: percentile(sorted, 10.0)?,
        p50: percentile(sorted, 50.0)?,
        p90: percentile(sorted, 90.0)?,
        min,
        max,
        // Summation error must not push the mean outside [min, max]
        mean: mean.clamp(min, max),
    })
}
