// Autocorrelogram engine
// Binned histogram of pairwise spike-time lags, computed with a bounded sliding window

use serde::{Deserialize, Serialize};

use crate::metrics::value::MetricFailure;

/// Symmetric lag histogram of a unit's own spikes.
///
/// With `n = ceil(window / bin)` bins per side, `counts` has `2n` entries. A pair with
/// lag `d` (0 <= d < window) adds one count to bin `n + k` and one to its mirror
/// `n - 1 - k`, where `k = floor(d / bin)`. The histogram is therefore exactly symmetric.
/// Coincident spikes (d = 0) split across the two centre bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autocorrelogram {
    pub bin_width_s: f64,
    pub window_s: f64,
    pub counts: Vec<u64>,
}

/// Bins per side for a given bin width and window
pub fn bins_per_side(bin_width_s: f64, window_s: f64) -> usize {
    if !(bin_width_s > 0.0) || !(window_s > 0.0) {
        return 0;
    }
    let ratio = window_s / bin_width_s;
    let nearest = ratio.round();
    // 0.05 / 0.001 must give 50 bins, not 51
    if (ratio - nearest).abs() < 1e-9 {
        nearest as usize
    } else {
        ratio.ceil() as usize
    }
}

/// Lag bin index on the positive side, clamped into range
#[inline]
pub fn lag_bin(lag_s: f64, bin_width_s: f64, n_side: usize) -> usize {
    ((lag_s / bin_width_s).floor() as usize).min(n_side - 1)
}

impl Autocorrelogram {
    /// Compute the autocorrelogram of sorted spike times.
    /// Zero or one spike gives an all-zero histogram.
    pub fn compute(spike_times: &[f64], bin_width_s: f64, window_s: f64) -> Self {
        let n_side = bins_per_side(bin_width_s, window_s);
        let mut counts = vec![0u64; 2 * n_side];

        if n_side > 0 {
            let mut hi = 0;
            for i in 0..spike_times.len() {
                let t = spike_times[i];
                if hi < i + 1 {
                    hi = i + 1;
                }
                // hi only moves forward: every spike is passed over at most once
                while hi < spike_times.len() && spike_times[hi] - t < window_s {
                    hi += 1;
                }
                for &other in &spike_times[i + 1..hi] {
                    let k = lag_bin(other - t, bin_width_s, n_side);
                    counts[n_side + k] += 1;
                    counts[n_side - 1 - k] += 1;
                }
            }
        }

        Autocorrelogram {
            bin_width_s,
            window_s,
            counts,
        }
    }

    pub fn bins_per_side(&self) -> usize {
        self.counts.len() / 2
    }

    /// Lag at the centre of every bin, negative side first
    pub fn lag_centers(&self) -> Vec<f64> {
        let n = self.bins_per_side() as isize;
        (-n..n)
            .map(|k| (k as f64 + 0.5) * self.bin_width_s)
            .collect()
    }

    /// Number of spike pairs within the window (each pair counted once)
    pub fn total_pairs(&self) -> u64 {
        self.counts.iter().sum::<u64>() / 2
    }

    /// Mean count of the bins inside the refractory period divided by the mean count
    /// of the outer half of the window.
    pub fn refractory_ratio(&self, refractory_s: f64) -> Result<f64, MetricFailure> {
        let n = self.bins_per_side();
        if n < 2 {
            return Err(MetricFailure::insufficient("autocorrelogram bins per side", 2, n));
        }

        // Positive side only: the histogram is symmetric
        let positive = &self.counts[n..];
        let inner_bins = ((refractory_s / self.bin_width_s).ceil() as usize).clamp(1, n / 2);
        let inner = &positive[..inner_bins];
        let outer = &positive[n / 2..];

        let outer_mean = outer.iter().sum::<u64>() as f64 / outer.len() as f64;
        if outer_mean == 0.0 {
            let outer_pairs = outer.iter().sum::<u64>() as usize;
            return Err(MetricFailure::insufficient("spike pairs in outer lag window", 1, outer_pairs));
        }
        let inner_mean = inner.iter().sum::<u64>() as f64 / inner.len() as f64;

        Ok(inner_mean / outer_mean)
    }
}

/// Number of spike pairs whose lag lies in `[min_lag_s, max_lag_s]`.
/// Same forward-only sweep as [`Autocorrelogram::compute`].
pub fn pairs_within(spike_times: &[f64], min_lag_s: f64, max_lag_s: f64) -> u64 {
    let mut total = 0u64;
    let mut hi = 0;
    for i in 0..spike_times.len() {
        let t = spike_times[i];
        if hi < i + 1 {
            hi = i + 1;
        }
        while hi < spike_times.len() && spike_times[hi] - t <= max_lag_s {
            hi += 1;
        }
        total += spike_times[i + 1..hi]
            .iter()
            .filter(|&&other| other - t >= min_lag_s)
            .count() as u64;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference implementation: every ordered pair, signed lag. A zero lag goes to the
    /// positive side for i < j and the negative side otherwise.
    fn brute_force(times: &[f64], bin: f64, window: f64) -> Vec<u64> {
        let n_side = bins_per_side(bin, window);
        let mut counts = vec![0u64; 2 * n_side];
        for (i, &a) in times.iter().enumerate() {
            for (j, &b) in times.iter().enumerate() {
                if i == j {
                    continue;
                }
                let d = b - a;
                if d.abs() >= window {
                    continue;
                }
                let k = lag_bin(d.abs(), bin, n_side);
                if d > 0.0 || (d == 0.0 && i < j) {
                    counts[n_side + k] += 1;
                } else {
                    counts[n_side - 1 - k] += 1;
                }
            }
        }
        counts
    }

    /// Deterministic, strictly increasing pseudo-random spike train
    fn synthetic_train(n: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        let mut t = 0.0;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let u = ((state >> 11) as f64) / ((1u64 << 53) as f64);
                t += 0.0003 + 0.01 * u;
                t
            })
            .collect()
    }

    #[test]
    fn test_empty_and_single_spike_are_all_zero() {
        let empty = Autocorrelogram::compute(&[], 0.001, 0.05);
        assert_eq!(empty.counts.len(), 100);
        assert!(empty.counts.iter().all(|&c| c == 0));

        let single = Autocorrelogram::compute(&[1.5], 0.001, 0.05);
        assert!(single.counts.iter().all(|&c| c == 0));
        assert_eq!(single.total_pairs(), 0);
    }

    #[test]
    fn test_matches_brute_force() {
        for (n, seed) in [(2usize, 1u64), (17, 2), (120, 3), (200, 4)] {
            let times = synthetic_train(n, seed);
            let acg = Autocorrelogram::compute(&times, 0.001, 0.02);
            assert_eq!(acg.counts, brute_force(&times, 0.001, 0.02), "n = {}", n);
        }
    }

    #[test]
    fn test_duplicate_times_match_brute_force() {
        let times = [0.010, 0.010, 0.0125];
        let acg = Autocorrelogram::compute(&times, 0.001, 0.005);
        assert_eq!(acg.counts, brute_force(&times, 0.001, 0.005));
        assert_eq!(acg.counts, vec![0, 0, 2, 0, 1, 1, 0, 2, 0, 0]);
        assert_eq!(acg.total_pairs(), 3);

        let mut train = synthetic_train(80, 5);
        let repeated: Vec<f64> = train.iter().step_by(7).copied().collect();
        train.extend(repeated);
        train.sort_by(|a, b| a.total_cmp(b));
        let acg = Autocorrelogram::compute(&train, 0.001, 0.02);
        assert_eq!(acg.counts, brute_force(&train, 0.001, 0.02));
    }

    #[test]
    fn test_symmetric() {
        let times = synthetic_train(150, 9);
        let acg = Autocorrelogram::compute(&times, 0.0005, 0.01);
        let n = acg.bins_per_side();
        for k in 0..n {
            assert_eq!(acg.counts[n + k], acg.counts[n - 1 - k]);
        }
    }

    #[test]
    fn test_simple_counts() {
        // Lags: 0.375 (1-2), 0.875 (1-3), 0.5 (2-3)
        let times = [0.0, 0.375, 0.875];
        let acg = Autocorrelogram::compute(&times, 0.25, 1.25);
        let n = acg.bins_per_side();
        assert_eq!(n, 5);
        assert_eq!(acg.counts[n + 1], 1);
        assert_eq!(acg.counts[n + 2], 1);
        assert_eq!(acg.counts[n + 3], 1);
        assert_eq!(acg.total_pairs(), 3);
    }

    #[test]
    fn test_lag_centers() {
        let acg = Autocorrelogram::compute(&[], 0.5, 1.0);
        assert_eq!(acg.lag_centers(), vec![-0.75, -0.25, 0.25, 0.75]);
    }

    #[test]
    fn test_pairs_within_matches_brute_force() {
        let times = synthetic_train(200, 11);
        let (lo, hi) = (0.0005, 0.002);
        let mut expected = 0u64;
        for i in 0..times.len() {
            for j in (i + 1)..times.len() {
                let d = times[j] - times[i];
                if d >= lo && d <= hi {
                    expected += 1;
                }
            }
        }
        assert_eq!(pairs_within(&times, lo, hi), expected);
        assert_eq!(pairs_within(&[], lo, hi), 0);
    }

    #[test]
    fn test_refractory_ratio() {
        // Regular 10 ms train: nothing inside 2 ms, plenty of pairs at the window edge
        let times: Vec<f64> = (0..500).map(|i| i as f64 * 0.01).collect();
        let acg = Autocorrelogram::compute(&times, 0.001, 0.05);
        let ratio = acg.refractory_ratio(0.002).unwrap();
        assert_eq!(ratio, 0.0);

        let empty = Autocorrelogram::compute(&[0.0], 0.001, 0.05);
        assert!(empty.refractory_ratio(0.002).is_err());
    }
}
