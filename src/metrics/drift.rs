// Drift estimation
// Median spike depth per time bin; max and cumulative drift of a unit over the recording

use crate::metrics::acg::bins_per_side;
use crate::metrics::config::DriftConfig;
use crate::metrics::stats;
use crate::metrics::value::{MetricFailure, MetricValue};
use crate::units::{SpikeFeatures, Unit};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftEstimate {
    /// Largest minus smallest median depth, µm
    pub max_drift: f64,
    /// Sum of absolute changes between consecutive median depths, µm
    pub cumulative_drift: f64,
}

/// Per-spike depth as the energy-weighted mean depth of the feature channels.
/// Uses the first component of each channel with negative values clipped to zero;
/// spikes with no energy get NaN and are skipped by the median.
pub fn depths_from_features(features: &SpikeFeatures, channel_positions: &[[f64; 2]]) -> Vec<f64> {
    (0..features.n_spikes())
        .map(|s| {
            let mut weighted = 0.0;
            let mut total = 0.0;
            for (slot, &ch) in features.channels.iter().enumerate() {
                let pc1 = features.block(s, slot)[0].max(0.0);
                let energy = pc1 * pc1;
                weighted += channel_positions[ch][1] * energy;
                total += energy;
            }
            if total > 0.0 {
                weighted / total
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Max and cumulative drift from sorted spike times and matching depths
pub fn estimate_drift(times: &[f64], depths: &[f64], bin_s: f64) -> Result<DriftEstimate, MetricFailure> {
    if times.len() < 2 {
        return Err(MetricFailure::insufficient("spikes", 2, times.len()));
    }
    let first = times[0];
    let span = times[times.len() - 1] - first;
    if !(span > 0.0) {
        return Err(MetricFailure::insufficient("distinct spike times", 2, 1));
    }

    // Short-lived units still get two half-span bins
    let bin = if span < 2.0 * bin_s { span / 2.0 } else { bin_s };
    let n_bins = bins_per_side(bin, span).saturating_sub(1);
    if n_bins == 0 {
        return Err(MetricFailure::insufficient("drift bins", 1, 0));
    }

    let mut medians = Vec::with_capacity(n_bins);
    for b in 0..n_bins {
        let start = first + b as f64 * bin;
        let end = start + bin;
        let lo = times.partition_point(|&t| t < start);
        let hi = times.partition_point(|&t| t < end);
        let in_bin: Vec<f64> = depths[lo..hi].iter().copied().filter(|d| d.is_finite()).collect();
        if let Some(m) = stats::median(&in_bin) {
            medians.push(m);
        }
    }
    if medians.is_empty() {
        return Err(MetricFailure::insufficient("depth estimates", 1, 0));
    }

    let max = medians.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = medians.iter().copied().fold(f64::INFINITY, f64::min);
    let cumulative = medians.windows(2).map(|w| (w[1] - w[0]).abs()).sum();

    Ok(DriftEstimate {
        max_drift: max - min,
        cumulative_drift: cumulative,
    })
}

/// Drift metrics of one unit: (max drift, cumulative drift).
/// Not applicable when the unit has neither depth estimates nor feature coordinates.
pub fn extract(unit: &Unit, channel_positions: &[[f64; 2]], config: &DriftConfig) -> (MetricValue, MetricValue) {
    let derived;
    let depths: &[f64] = match (&unit.spike_depths, &unit.features) {
        (Some(depths), _) => depths,
        (None, Some(features)) => {
            derived = depths_from_features(features, channel_positions);
            &derived
        }
        (None, None) => return (MetricValue::NotApplicable, MetricValue::NotApplicable),
    };

    match estimate_drift(&unit.spike_times, depths, config.bin_s) {
        Ok(estimate) => (
            MetricValue::defined(estimate.max_drift),
            MetricValue::defined(estimate.cumulative_drift),
        ),
        Err(reason) => (
            MetricValue::undefined(reason.clone()),
            MetricValue::undefined(reason),
        ),
    }
}
