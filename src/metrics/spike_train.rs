// Spike-train feature extractor
// Firing rate, presence ratio, refractory violations and percent spikes missing

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

use crate::metrics::acg::pairs_within;
use crate::metrics::config::{
    AmplitudeConfig, MetricsConfig, PresenceConfig, RefractoryConfig, RpvMethod, TimeChunkConfig,
};
use crate::metrics::fit::{levenberg_marquardt, CutGaussian, FitOptions};
use crate::metrics::stats;
use crate::metrics::value::{MetricFailure, MetricValue};

/// Time range the spike-train metrics are computed over
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start_s: f64,
    pub end_s: f64,
}

impl ActiveWindow {
    pub fn whole(duration_s: f64) -> Self {
        ActiveWindow {
            start_s: 0.0,
            end_s: duration_s,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_s - self.start_s
    }

    /// Index range of the sorted `times` that fall inside the window (both ends inclusive)
    pub fn index_range(&self, times: &[f64]) -> std::ops::Range<usize> {
        let lo = times.partition_point(|&t| t < self.start_s);
        let hi = times.partition_point(|&t| t <= self.end_s);
        lo..hi.max(lo)
    }
}

/// Zero bins padded below the amplitude histogram, as a multiple of its bin count
const MAX_PAD_FACTOR: usize = 4;

/// Smallest amplitude range, relative to the amplitude level, that still yields a usable histogram
const MIN_RELATIVE_SPREAD: f64 = 1e-9;

/// Standard normal CDF
fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

pub fn firing_rate(n_spikes: usize, window: &ActiveWindow) -> Result<f64, MetricFailure> {
    if !(window.duration() > 0.0) {
        return Err(MetricFailure::fit("empty active window"));
    }
    Ok(n_spikes as f64 / window.duration())
}

/// Fraction of equal-sized bins over the window that contain enough spikes.
/// A bin counts when it holds at least one spike, or with `min_bin_fraction` set, at least
/// `max(1, fraction × p90)` spikes.
pub fn presence_ratio(
    times: &[f64],
    window: &ActiveWindow,
    config: &PresenceConfig,
) -> Result<f64, MetricFailure> {
    let duration = window.duration();
    if !(duration > 0.0) {
        return Err(MetricFailure::fit("empty active window"));
    }

    let n_bins = ((duration / config.bin_s).floor() as usize).max(1);
    let width = duration / n_bins as f64;
    let mut counts = vec![0usize; n_bins];
    for &t in &times[window.index_range(times)] {
        let bin = (((t - window.start_s) / width).floor() as usize).min(n_bins - 1);
        counts[bin] += 1;
    }

    let threshold = match config.min_bin_fraction {
        Some(fraction) => {
            let as_f64: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
            let p90 = stats::percentile(&as_f64, 90.0).unwrap_or(0.0);
            (fraction * p90).max(1.0)
        }
        None => 1.0,
    };

    let present = counts.iter().filter(|&&c| c as f64 >= threshold).count();
    Ok(present as f64 / n_bins as f64)
}

/// Hill estimator: contamination from the number of consecutive ISIs at or below `tau_r`
pub fn rpv_hill(times: &[f64], duration_s: f64, tau_r: f64, tau_c: f64) -> f64 {
    let n = times.len();
    let violations = times.windows(2).filter(|w| w[1] - w[0] <= tau_r).count();
    if violations == 0 {
        return 0.0;
    }

    let v = violations as f64;
    let nf = n as f64;
    let k = 2.0 * (tau_r - tau_c) * nf * nf;
    // Roots of -k r² + k r - vT = 0; the smaller one is the contamination
    let discriminant = 1.0 - 4.0 * v * duration_s / k;
    let fraction = if discriminant >= 0.0 {
        (1.0 - discriminant.sqrt()) / 2.0
    } else if violations < n {
        v / (2.0 * (tau_r - tau_c) * (nf - v))
    } else {
        1.0
    };
    fraction.clamp(0.0, 1.0)
}

/// Llobet estimator: all spike pairs with lag in `[tau_c, tau_r]`
pub fn rpv_llobet(times: &[f64], duration_s: f64, tau_r: f64, tau_c: f64) -> f64 {
    let n = times.len();
    if n < 2 {
        return 0.0;
    }
    let pairs = pairs_within(times, tau_c, tau_r) as f64;
    let nf = n as f64;
    let under_root = 1.0 - pairs * (duration_s - 2.0 * nf * tau_c) / (nf * nf * (tau_r - tau_c));
    if under_root >= 0.0 {
        (1.0 - under_root.sqrt()).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Contamination at every candidate refractory period
pub fn rpv_sweep(times: &[f64], duration_s: f64, config: &RefractoryConfig) -> Vec<f64> {
    config
        .tau_r_s
        .iter()
        .map(|&tau_r| match config.method {
            RpvMethod::Hill => rpv_hill(times, duration_s, tau_r, config.tau_c_s),
            RpvMethod::Llobet => rpv_llobet(times, duration_s, tau_r, config.tau_c_s),
        })
        .collect()
}

/// Index of the smallest value, first on ties
fn argmin_first(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[best] {
            best = i;
        }
    }
    best
}

/// Refractory-violation fraction at the least contaminated candidate refractory period
pub fn fraction_rpv(
    times: &[f64],
    duration_s: f64,
    config: &RefractoryConfig,
) -> Result<f64, MetricFailure> {
    if !(duration_s > 0.0) {
        return Err(MetricFailure::fit("empty active window"));
    }
    let sweep = rpv_sweep(times, duration_s, config);
    if sweep.is_empty() {
        return Err(MetricFailure::insufficient("refractory periods", 1, 0));
    }
    Ok(sweep[argmin_first(&sweep)])
}

/// Estimated percentage of spikes below the detection threshold, from a cut-Gaussian fit
/// to the amplitude distribution
pub fn percent_missing(amplitudes: &[f64], config: &AmplitudeConfig) -> Result<f64, MetricFailure> {
    if amplitudes.len() < config.min_spikes {
        return Err(MetricFailure::insufficient(
            "spikes",
            config.min_spikes,
            amplitudes.len(),
        ));
    }

    // Drop extreme outliers above p99 + factor × (p99 - p1)
    let mut sorted = amplitudes.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p1 = stats::percentile_sorted(&sorted, 1.0);
    let p99 = stats::percentile_sorted(&sorted, 99.0);
    let limit = p99 + config.outlier_factor * (p99 - p1);
    let kept: Vec<f64> = sorted.into_iter().filter(|&a| a <= limit).collect();
    if kept.len() < config.min_spikes {
        return Err(MetricFailure::insufficient("spikes", config.min_spikes, kept.len()));
    }

    let (lo, hi) = (kept[0], kept[kept.len() - 1]);
    if !(hi > lo) {
        return Err(MetricFailure::fit("zero amplitude variance"));
    }
    if hi - lo <= MIN_RELATIVE_SPREAD * hi.abs().max(lo.abs()) {
        return Err(MetricFailure::fit("amplitude spread too small relative to level"));
    }

    let n_bins = config.n_bins;
    let step = (hi - lo) / n_bins as f64;
    let mut counts = vec![0.0f64; n_bins];
    for &a in &kept {
        let bin = (((a - lo) / step).floor() as usize).min(n_bins - 1);
        counts[bin] += 1.0;
    }

    // Mode seed: left edge of the (averaged) most populated bin
    let max_count = counts.iter().copied().fold(0.0, f64::max);
    let modal: Vec<usize> = (0..n_bins).filter(|&i| counts[i] == max_count).collect();
    let mode_bin = modal.iter().sum::<usize>() / modal.len();
    let mode_seed = lo + mode_bin as f64 * step;

    // Pad the histogram with empty bins down to zero amplitude, at most MAX_PAD_FACTOR × n_bins
    let first_center = lo + step / 2.0;
    let next_low = first_center - step;
    let k = (next_low / step).ceil();
    let n_pad = if k + 1.0 > (MAX_PAD_FACTOR * n_bins) as f64 {
        MAX_PAD_FACTOR * n_bins
    } else {
        (k + 1.0).max(0.0) as usize
    };
    let min_bin = next_low - step * n_pad.saturating_sub(1) as f64;

    let mut xs: Vec<f64> = (0..n_pad).map(|i| min_bin + i as f64 * step).collect();
    xs.extend((0..n_bins).map(|i| first_center + i as f64 * step));
    let mut ys = vec![0.0; n_pad];
    ys.extend_from_slice(&counts);

    // Jumping straight from an empty bin to the peak means the peak itself is cut off
    let max_jump = ys
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold(f64::NEG_INFINITY, f64::max);
    if max_count == max_jump {
        return Err(MetricFailure::fit("amplitude distribution peak is truncated"));
    }

    let spread = stats::std_dev(&kept).unwrap_or(0.0);
    if spread == 0.0 {
        return Err(MetricFailure::fit("zero amplitude variance"));
    }
    let cut = stats::percentile_sorted(&kept, 1.0);

    let model = CutGaussian { cut };
    let options = FitOptions {
        max_iterations: config.max_iterations,
        ..FitOptions::default()
    };
    let fit = levenberg_marquardt(&model, &xs, &ys, &[max_count, mode_seed, spread], options)?;

    let (mu, sigma) = (fit.params[1], fit.params[2]);
    if sigma == 0.0 {
        return Err(MetricFailure::fit("fitted Gaussian has zero width"));
    }
    Ok(100.0 * (1.0 - normal_cdf((mu - cut) / sigma.abs())))
}

/// Per-chunk quality used to pick the good time window
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkQuality {
    pub window: ActiveWindow,
    pub percent_missing: MetricValue,
    /// Contamination at every candidate refractory period
    pub rpv: Vec<f64>,
}

/// Split the recording into chunks and score each one
pub fn score_chunks(
    times: &[f64],
    amplitudes: &[f64],
    duration_s: f64,
    chunks: &TimeChunkConfig,
    amplitude: &AmplitudeConfig,
    refractory: &RefractoryConfig,
) -> Vec<ChunkQuality> {
    let n_chunks = ((duration_s / chunks.chunk_s).ceil() as usize).max(1);
    (0..n_chunks)
        .map(|c| {
            let start = c as f64 * chunks.chunk_s;
            let end = if c + 1 == n_chunks {
                duration_s
            } else {
                (c + 1) as f64 * chunks.chunk_s
            };
            // Half-open chunks, except the last which keeps the final spike
            let lo = times.partition_point(|&t| t < start);
            let hi = if c + 1 == n_chunks {
                times.len()
            } else {
                times.partition_point(|&t| t < end)
            };
            let window = ActiveWindow {
                start_s: start,
                end_s: end,
            };
            ChunkQuality {
                window,
                percent_missing: percent_missing(&amplitudes[lo..hi], amplitude).into(),
                rpv: rpv_sweep(&times[lo..hi], window.duration(), refractory),
            }
        })
        .collect()
}

/// Longest contiguous run of chunks that pass both cutoffs (first run on ties),
/// or the whole recording when no chunk passes
pub fn good_time_window(scores: &[ChunkQuality], chunks: &TimeChunkConfig, duration_s: f64) -> ActiveWindow {
    if scores.is_empty() {
        return ActiveWindow::whole(duration_s);
    }

    // Refractory period with the least summed contamination over all chunks
    let n_tau = scores[0].rpv.len();
    let sums: Vec<f64> = (0..n_tau)
        .map(|j| scores.iter().map(|s| s.rpv[j]).sum())
        .collect();
    let tau = if sums.is_empty() { 0 } else { argmin_first(&sums) };

    let good: Vec<bool> = scores
        .iter()
        .map(|s| {
            let missing_ok = s
                .percent_missing
                .value()
                .map_or(false, |p| p < chunks.max_percent_missing);
            let rpv_ok = s.rpv.get(tau).map_or(false, |&r| r < chunks.max_rpv);
            missing_ok && rpv_ok
        })
        .collect();

    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;
    for i in 0..=good.len() {
        let is_good = i < good.len() && good[i];
        match (is_good, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                let len = i - start;
                if best.map_or(true, |(s, e)| len > e - s) {
                    best = Some((start, i));
                }
                run_start = None;
            }
            _ => {}
        }
    }

    match best {
        Some((first, end)) => ActiveWindow {
            start_s: scores[first].window.start_s,
            end_s: scores[end - 1].window.end_s,
        },
        None => ActiveWindow::whole(duration_s),
    }
}

/// Spike-train metrics of one unit
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeTrainMetrics {
    pub n_spikes: MetricValue,
    pub firing_rate: MetricValue,
    pub presence_ratio: MetricValue,
    pub fraction_rpv: MetricValue,
    pub percent_missing: MetricValue,
    pub window: ActiveWindow,
}

/// Compute every spike-train metric, restricted to the good time window when chunking
/// is configured
pub fn extract(times: &[f64], amplitudes: &[f64], duration_s: f64, config: &MetricsConfig) -> SpikeTrainMetrics {
    let window = match &config.time_chunks {
        Some(chunks) => {
            let scores = score_chunks(
                times,
                amplitudes,
                duration_s,
                chunks,
                &config.amplitude,
                &config.refractory,
            );
            good_time_window(&scores, chunks, duration_s)
        }
        None => ActiveWindow::whole(duration_s),
    };

    let range = window.index_range(times);
    let times_in = &times[range.clone()];
    let amps_in = &amplitudes[range];

    SpikeTrainMetrics {
        n_spikes: MetricValue::from_count(times.len()),
        firing_rate: firing_rate(times_in.len(), &window).into(),
        presence_ratio: presence_ratio(times, &window, &config.presence).into(),
        fraction_rpv: fraction_rpv(times_in, window.duration(), &config.refractory).into(),
        percent_missing: percent_missing(amps_in, &config.amplitude).into(),
        window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic approximately-Gaussian amplitudes (sum of uniforms)
    fn gaussian_amplitudes(n: usize, mean: f64, sd: f64, seed: u64) -> Vec<f64> {
        let mut state = seed;
        let mut next = || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 11) as f64) / ((1u64 << 53) as f64)
        };
        (0..n)
            .map(|_| {
                let s: f64 = (0..12).map(|_| next()).sum::<f64>() - 6.0;
                mean + sd * s
            })
            .collect()
    }

    #[test]
    fn test_firing_rate() {
        let window = ActiveWindow::whole(100.0);
        assert_eq!(firing_rate(500, &window).unwrap(), 5.0);
        assert!(firing_rate(3, &ActiveWindow { start_s: 1.0, end_s: 1.0 }).is_err());
    }

    #[test]
    fn test_presence_ratio() {
        // 10 bins of 10 s; spikes in bins 0, 1 and 9 (the final spike sits on the end)
        let times = [1.0, 15.0, 16.0, 100.0];
        let config = PresenceConfig {
            bin_s: 10.0,
            min_bin_fraction: None,
        };
        let ratio = presence_ratio(&times, &ActiveWindow::whole(100.0), &config).unwrap();
        assert!((ratio - 0.3).abs() < 1e-12);

        // Recording shorter than one bin: a single bin
        let ratio = presence_ratio(&[1.0], &ActiveWindow::whole(5.0), &config).unwrap();
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn test_presence_ratio_fraction_of_p90() {
        // 10 bins: nine bins with 10 spikes, one with 1
        let mut times = Vec::new();
        for bin in 0..10 {
            let n = if bin == 4 { 1 } else { 10 };
            for k in 0..n {
                times.push(bin as f64 * 10.0 + 0.5 + k as f64 * 0.5);
            }
        }
        let strict = PresenceConfig {
            bin_s: 10.0,
            min_bin_fraction: Some(0.5),
        };
        let ratio = presence_ratio(&times, &ActiveWindow::whole(100.0), &strict).unwrap();
        assert!((ratio - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_hill_no_violations_is_zero() {
        let times: Vec<f64> = (0..500).map(|i| i as f64 * 0.2).collect();
        assert_eq!(rpv_hill(&times, 100.0, 0.002, 0.0001), 0.0);
        assert_eq!(rpv_hill(&[], 100.0, 0.002, 0.0001), 0.0);
        assert_eq!(rpv_hill(&[1.0], 100.0, 0.002, 0.0001), 0.0);
    }

    #[test]
    fn test_hill_matches_closed_form() {
        // 1000 spikes over 100 s with 10 violating ISIs
        let mut times: Vec<f64> = (0..990).map(|i| i as f64 * 0.1).collect();
        for i in 0..10 {
            times.push(99.05 + i as f64 * 0.09 + 0.0);
            times.push(99.05 + i as f64 * 0.09 + 0.001);
        }
        times.sort_by(|a, b| a.total_cmp(b));
        times.truncate(1000);
        let violations = times.windows(2).filter(|w| w[1] - w[0] <= 0.002).count() as f64;
        let n = times.len() as f64;
        let k = 2.0 * (0.002 - 0.0001) * n * n;
        let expected = (1.0 - (1.0 - 4.0 * violations * 100.0 / k).sqrt()) / 2.0;

        let r = rpv_hill(&times, 100.0, 0.002, 0.0001);
        assert!(violations > 0.0);
        assert!((r - expected).abs() < 1e-12);
        assert!(r > 0.0 && r < 0.5);
    }

    #[test]
    fn test_hill_saturates_to_one() {
        // Every ISI violates
        let times: Vec<f64> = (0..50).map(|i| i as f64 * 0.001).collect();
        assert_eq!(rpv_hill(&times, 100.0, 0.002, 0.0001), 1.0);
    }

    #[test]
    fn test_llobet() {
        let times: Vec<f64> = (0..500).map(|i| i as f64 * 0.2).collect();
        assert_eq!(rpv_llobet(&times, 100.0, 0.002, 0.0001), 0.0);

        let dense: Vec<f64> = (0..200).map(|i| i as f64 * 0.0005).collect();
        assert_eq!(rpv_llobet(&dense, 100.0, 0.002, 0.0001), 1.0);
    }

    #[test]
    fn test_sweep_keeps_least_contaminated() {
        // ISIs of 1.5 ms violate at tau_r = 2 ms but not at 1 ms
        let times: Vec<f64> = (0..100).map(|i| (i / 2) as f64 + (i % 2) as f64 * 0.0015).collect();
        let config = RefractoryConfig {
            tau_r_s: vec![0.002, 0.001],
            tau_c_s: 0.0001,
            method: RpvMethod::Hill,
        };
        let sweep = rpv_sweep(&times, 100.0, &config);
        assert!(sweep[0] > 0.0);
        assert_eq!(sweep[1], 0.0);
        assert_eq!(fraction_rpv(&times, 100.0, &config).unwrap(), 0.0);
    }

    #[test]
    fn test_percent_missing_insufficient() {
        let err = percent_missing(&[10.0, 11.0, 12.0], &AmplitudeConfig::default()).unwrap_err();
        assert_eq!(err, MetricFailure::insufficient("spikes", 6, 3));
    }

    #[test]
    fn test_percent_missing_zero_variance() {
        let err = percent_missing(&[10.0; 20], &AmplitudeConfig::default()).unwrap_err();
        assert!(matches!(err, MetricFailure::NumericalFit { .. }));
    }

    #[test]
    fn test_percent_missing_truncated_peak() {
        // Monotonically decreasing histogram: the mode sits on the lowest bin
        let mut amps = Vec::new();
        for bin in 0..10 {
            for _ in 0..(100 - bin * 10) {
                amps.push(50.0 + bin as f64);
            }
        }
        let err = percent_missing(&amps, &AmplitudeConfig::default()).unwrap_err();
        assert!(matches!(err, MetricFailure::NumericalFit { .. }));
    }

    #[test]
    fn test_percent_missing_saturated_amplitudes() {
        let amps: Vec<f64> = (0..1000).map(|i| 500.0 + (i % 7) as f64 * 1e-9).collect();
        let err = percent_missing(&amps, &AmplitudeConfig::default()).unwrap_err();
        assert_eq!(err, MetricFailure::fit("amplitude spread too small relative to level"));
    }

    #[test]
    fn test_percent_missing_far_from_zero() {
        // Padding down to zero would need thousands of bins here
        let amps = gaussian_amplitudes(2000, 10_000.0, 10.0, 7);
        let missing = percent_missing(&amps, &AmplitudeConfig::default()).unwrap();
        assert!(missing >= 0.0 && missing < 5.0, "missing = {}", missing);
    }

    #[test]
    fn test_percent_missing_full_distribution_is_small() {
        let amps = gaussian_amplitudes(2000, 100.0, 10.0, 7);
        let missing = percent_missing(&amps, &AmplitudeConfig::default()).unwrap();
        // Cut at the 1st percentile of a complete Gaussian: about 1% below it
        assert!(missing >= 0.0 && missing < 5.0, "missing = {}", missing);
    }

    #[test]
    fn test_good_time_window_longest_run() {
        let chunks = TimeChunkConfig {
            chunk_s: 10.0,
            max_percent_missing: 20.0,
            max_rpv: 0.1,
        };
        let score = |i: usize, ok: bool| ChunkQuality {
            window: ActiveWindow {
                start_s: i as f64 * 10.0,
                end_s: (i + 1) as f64 * 10.0,
            },
            percent_missing: MetricValue::defined(if ok { 5.0 } else { 50.0 }),
            rpv: vec![0.0],
        };
        let scores = vec![
            score(0, true),
            score(1, false),
            score(2, true),
            score(3, true),
            score(4, false),
            score(5, true),
            score(6, true),
        ];
        let window = good_time_window(&scores, &chunks, 70.0);
        assert_eq!(window, ActiveWindow { start_s: 20.0, end_s: 40.0 });

        let none: Vec<ChunkQuality> = (0..3).map(|i| score(i, false)).collect();
        assert_eq!(good_time_window(&none, &chunks, 30.0), ActiveWindow::whole(30.0));
    }

    #[test]
    fn test_undefined_chunk_is_not_good() {
        let chunks = TimeChunkConfig {
            chunk_s: 10.0,
            max_percent_missing: 20.0,
            max_rpv: 0.1,
        };
        let scores = vec![ChunkQuality {
            window: ActiveWindow { start_s: 0.0, end_s: 10.0 },
            percent_missing: MetricValue::undefined(MetricFailure::insufficient("spikes", 6, 2)),
            rpv: vec![0.0],
        }];
        assert_eq!(good_time_window(&scores, &chunks, 10.0), ActiveWindow::whole(10.0));
    }

    #[test]
    fn test_extract_with_few_spikes() {
        let config = MetricsConfig::default();
        let metrics = extract(&[1.0, 2.0, 3.0], &[50.0, 52.0, 51.0], 100.0, &config);
        assert_eq!(metrics.n_spikes.value(), Some(3.0));
        assert!((metrics.firing_rate.value().unwrap() - 0.03).abs() < 1e-12);
        assert_eq!(metrics.fraction_rpv.value(), Some(0.0));
        assert!(metrics.percent_missing.is_undefined());
        assert!(metrics.presence_ratio.is_defined());
    }

    #[test]
    fn test_extract_empty_train_never_fails() {
        let metrics = extract(&[], &[], 100.0, &MetricsConfig::default());
        assert_eq!(metrics.n_spikes.value(), Some(0.0));
        assert_eq!(metrics.firing_rate.value(), Some(0.0));
        assert_eq!(metrics.presence_ratio.value(), Some(0.0));
        assert!(metrics.percent_missing.is_undefined());
    }
}
