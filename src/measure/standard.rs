//! Standard per-object intensity metrics.

use serde::{Deserialize, Serialize};

/// Intensity metric computed for every object and channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardMetric {
    /// Mean intensity
    Mean,
    /// Sum of intensities
    Sum,
    /// Median intensity
    Median,
    /// Minimum intensity
    Min,
    /// Maximum intensity
    Max,
    /// 25th percentile
    Q25,
    /// 75th percentile
    Q75,
    /// 5th percentile
    Q05,
    /// 95th percentile
    Q95,
    /// Background-corrected total signal, `(mean - background) * area`
    Amount,
    /// Background-corrected amount per femtolitre of cell volume
    Concentration,
}

impl StandardMetric {
    /// Every standard metric.
    pub fn all() -> &'static [StandardMetric] {
        &[
            StandardMetric::Mean,
            StandardMetric::Sum,
            StandardMetric::Median,
            StandardMetric::Min,
            StandardMetric::Max,
            StandardMetric::Q25,
            StandardMetric::Q75,
            StandardMetric::Q05,
            StandardMetric::Q95,
            StandardMetric::Amount,
            StandardMetric::Concentration,
        ]
    }

    /// Metric name as used in column names.
    pub fn name(&self) -> &'static str {
        match self {
            StandardMetric::Mean => "mean",
            StandardMetric::Sum => "sum",
            StandardMetric::Median => "median",
            StandardMetric::Min => "min",
            StandardMetric::Max => "max",
            StandardMetric::Q25 => "q25",
            StandardMetric::Q75 => "q75",
            StandardMetric::Q05 => "q05",
            StandardMetric::Q95 => "q95",
            StandardMetric::Amount => "amount",
            StandardMetric::Concentration => "concentration",
        }
    }

    /// Whether the metric subtracts the background.
    pub fn uses_background(&self) -> bool {
        matches!(self, StandardMetric::Amount | StandardMetric::Concentration)
    }

    /// Column name for a channel: `<channel>_<metric>`, or
    /// `<channel>_autoBkgr_<metric>` for background-corrected metrics.
    pub fn column(&self, channel: &str) -> String {
        if self.uses_background() {
            format!("{}_autoBkgr_{}", channel, self.name())
        } else {
            format!("{}_{}", channel, self.name())
        }
    }

    /// Evaluate on the sorted intensities of one object.
    ///
    /// `area` is the object's pixel count and `vol_fl` its volume. Empty
    /// objects and zero volumes give `NaN`.
    pub fn evaluate(&self, sorted: &[f64], background: f64, area: usize, vol_fl: f64) -> f64 {
        if sorted.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = sorted.iter().sum();
        let mean = sum / sorted.len() as f64;
        match self {
            StandardMetric::Mean => mean,
            StandardMetric::Sum => sum,
            StandardMetric::Median => quantile(sorted, 0.5),
            StandardMetric::Min => sorted[0],
            StandardMetric::Max => sorted[sorted.len() - 1],
            StandardMetric::Q25 => quantile(sorted, 0.25),
            StandardMetric::Q75 => quantile(sorted, 0.75),
            StandardMetric::Q05 => quantile(sorted, 0.05),
            StandardMetric::Q95 => quantile(sorted, 0.95),
            StandardMetric::Amount => (mean - background) * area as f64,
            StandardMetric::Concentration => {
                if vol_fl > 0.0 {
                    (mean - background) * area as f64 / vol_fl
                } else {
                    f64::NAN
                }
            }
        }
    }
}

/// Quantile of sorted values with linear interpolation between ranks.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Median of unsorted values, `NaN` when empty.
pub fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    quantile(values, 0.5)
}
