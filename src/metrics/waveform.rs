// Waveform feature extractor
// Shape metrics of a unit's template: extrema counts, duration, ratios, spatial decay, SNR, somatic flag

use crate::metrics::config::{DecayFit, NonSomaticCriteria, SpatialDecayConfig, WaveformConfig};
use crate::metrics::peaks::{argmax, argmin, find_peaks, find_troughs, most_prominent};
use crate::metrics::stats;
use crate::metrics::value::{MetricFailure, MetricValue};
use crate::units::{Template, Unit};

/// Waveform metrics of one unit, one value per metric
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformMetrics {
    pub n_peaks: MetricValue,
    pub n_troughs: MetricValue,
    pub duration_us: MetricValue,
    pub main_peak_to_trough: MetricValue,
    pub second_peak_to_trough: MetricValue,
    pub peak1_to_peak2: MetricValue,
    pub trough_to_peak2: MetricValue,
    pub peak_before_width: MetricValue,
    pub trough_width: MetricValue,
    pub baseline_flatness: MetricValue,
    pub template_amplitude: MetricValue,
    pub spatial_decay_slope: MetricValue,
    pub signal_to_noise: MetricValue,
    pub is_somatic: MetricValue,
}

impl WaveformMetrics {
    /// Every shape metric undefined for the same reason
    fn failed(reason: MetricFailure, spatial_decay: bool, somatic: bool) -> Self {
        let u = || MetricValue::undefined(reason.clone());
        WaveformMetrics {
            n_peaks: u(),
            n_troughs: u(),
            duration_us: u(),
            main_peak_to_trough: u(),
            second_peak_to_trough: u(),
            peak1_to_peak2: u(),
            trough_to_peak2: u(),
            peak_before_width: u(),
            trough_width: u(),
            baseline_flatness: u(),
            template_amplitude: u(),
            spatial_decay_slope: if spatial_decay { u() } else { MetricValue::NotApplicable },
            signal_to_noise: u(),
            is_somatic: if somatic { u() } else { MetricValue::NotApplicable },
        }
    }
}

/// Extrema structure of a single-channel waveform
#[derive(Debug, Clone, PartialEq)]
struct Shape {
    n_peaks: usize,
    n_troughs: usize,
    /// Signed value of the main trough
    trough: f64,
    peak_before: Option<f64>,
    peak_after: Option<f64>,
    peak_before_width: Option<f64>,
    trough_width: Option<f64>,
}

/// Peak search on one side of the main trough.
/// Returns the candidate locations, the width of the most prominent one, and whether
/// the strict prominence found nothing (so a fallback location was used).
fn side_peaks(
    segment: &[f64],
    offset: usize,
    min_prominence: f64,
    fallback_prominence: f64,
) -> (Vec<usize>, Option<f64>, bool) {
    if segment.len() > 2 {
        let found = find_peaks(segment, min_prominence);
        if let Some(best) = most_prominent(&found) {
            let width = best.width;
            return (found.iter().map(|p| p.index + offset).collect(), Some(width), false);
        }
    }

    // Nothing at the strict prominence: retry at 1% of max |w|, then fall back to the raw maximum
    let mut locs = Vec::new();
    let mut width = None;
    if segment.len() > 2 {
        let found = find_peaks(segment, fallback_prominence);
        if found.len() > 1 {
            if let Some(best) = most_prominent(&found) {
                locs.push(best.index + offset);
                width = Some(best.width);
            }
        } else if let Some(only) = found.first() {
            locs.push(only.index + offset);
        }
    }
    if locs.is_empty() {
        if let Some(i) = argmax(segment) {
            locs.push(i + offset);
        }
    }
    (locs, width, true)
}

fn max_at(w: &[f64], locs: &[usize]) -> Option<f64> {
    locs.iter().map(|&i| w[i]).fold(None, |acc, v| match acc {
        Some(m) if m >= v => Some(m),
        _ => Some(v),
    })
}

fn analyze_shape(w: &[f64], min_prominence_fraction: f64) -> Result<Shape, MetricFailure> {
    if w.len() < 3 {
        return Err(MetricFailure::insufficient("template samples", 3, w.len()));
    }
    let max_abs = w.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if max_abs == 0.0 {
        return Err(MetricFailure::fit("flat template"));
    }
    let min_prominence = min_prominence_fraction * max_abs;
    let fallback_prominence = 0.01 * max_abs;

    let troughs = find_troughs(w, min_prominence);
    let (trough_locs, trough_width) = match most_prominent(&troughs) {
        Some(best) => (troughs.iter().map(|t| t.index).collect::<Vec<_>>(), Some(best.width)),
        None => {
            let i = argmin(w).ok_or_else(|| MetricFailure::fit("empty waveform"))?;
            (vec![i], None)
        }
    };

    // Deepest trough, first on ties
    let mut trough_loc = trough_locs[0];
    for &loc in &trough_locs[1..] {
        if w[loc] < w[trough_loc] {
            trough_loc = loc;
        }
    }
    let trough = w[trough_loc];

    let (before_locs, peak_before_width, mut used_max_before) =
        side_peaks(&w[..trough_loc], 0, min_prominence, fallback_prominence);
    let (after_locs, _, mut used_max_after) =
        side_peaks(&w[trough_loc..], trough_loc, min_prominence, fallback_prominence);

    let peak_before = max_at(w, &before_locs);
    let peak_after = max_at(w, &after_locs);

    // Neither side had a prominent peak: the larger one is the real peak
    if used_max_before && used_max_after {
        let before = peak_before.unwrap_or(f64::NEG_INFINITY);
        let after = peak_after.unwrap_or(f64::NEG_INFINITY);
        if before > after {
            used_max_before = false;
        } else {
            used_max_after = false;
        }
    }

    let small = |v: Option<f64>| v.map_or(true, |v| v < min_prominence * 0.5);
    let n_peaks = if used_max_before && small(peak_before) {
        after_locs.len()
    } else if used_max_after && small(peak_after) {
        before_locs.len()
    } else {
        before_locs.len() + after_locs.len()
    };

    Ok(Shape {
        n_peaks,
        n_troughs: trough_locs.len(),
        trough,
        peak_before,
        peak_after,
        peak_before_width,
        trough_width,
    })
}

/// `|numerator / denominator|`; a missing or zero numerator gives 0, a zero denominator
/// gives an undefined value
fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> MetricValue {
    match denominator {
        None => MetricValue::undefined(MetricFailure::insufficient("ratio denominator", 1, 0)),
        Some(d) if d == 0.0 => MetricValue::undefined(MetricFailure::fit("zero ratio denominator")),
        Some(d) => match numerator {
            None => MetricValue::defined(0.0),
            Some(n) if n == 0.0 => MetricValue::defined(0.0),
            Some(n) => MetricValue::defined((n / d).abs()),
        },
    }
}

/// Time between the dominant extremum and the opposite extremum that follows it, in µs
fn peak_trough_duration(w: &[f64], sample_rate_hz: f64) -> Result<f64, MetricFailure> {
    let mut dominant = 0;
    for (i, v) in w.iter().enumerate() {
        if v.abs() > w[dominant].abs() {
            dominant = i;
        }
    }
    let tail = &w[dominant..];
    let opposite = if w[dominant] > 0.0 {
        argmin(tail)
    } else {
        argmax(tail)
    }
    .map(|i| i + dominant)
    .unwrap_or(dominant);

    if opposite == dominant {
        return Err(MetricFailure::insufficient(
            "opposite extremum after the dominant one",
            1,
            0,
        ));
    }
    Ok(1e6 * (opposite - dominant) as f64 / sample_rate_hz)
}

fn baseline_window<'a>(w: &'a [f64], window: [usize; 2]) -> Result<&'a [f64], MetricFailure> {
    let [start, end] = window;
    let end = end.min(w.len());
    if start >= end {
        return Err(MetricFailure::insufficient("baseline samples", window[1], w.len()));
    }
    Ok(&w[start..end])
}

fn baseline_flatness(w: &[f64], window: [usize; 2]) -> Result<f64, MetricFailure> {
    let baseline = baseline_window(w, window)?;
    let max_abs = w.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if max_abs == 0.0 {
        return Err(MetricFailure::fit("flat template"));
    }
    Ok(baseline.iter().fold(0.0f64, |m, v| m.max(v.abs())) / max_abs)
}

/// Peak |amplitude| over the standard deviation of the noise samples, or of the
/// template's baseline window when no noise samples were supplied
fn signal_to_noise(
    w: &[f64],
    noise_samples: Option<&[f64]>,
    window: [usize; 2],
) -> Result<f64, MetricFailure> {
    let noise = match noise_samples {
        Some(samples) => samples,
        None => baseline_window(w, window)?,
    };
    if noise.len() < 2 {
        return Err(MetricFailure::insufficient("noise samples", 2, noise.len()));
    }
    let sd = stats::std_dev(noise).unwrap_or(0.0);
    if sd == 0.0 {
        return Err(MetricFailure::fit("zero noise standard deviation"));
    }
    let signal = w.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    Ok(signal / sd)
}

/// Decay of template amplitude with distance from the peak channel
pub fn spatial_decay_slope(
    template: &Template,
    peak_channel: usize,
    channel_positions: &[[f64; 2]],
    config: &SpatialDecayConfig,
) -> MetricValue {
    // Probe pitch too coarse for a meaningful profile
    let mut depths: Vec<f64> = channel_positions.iter().map(|p| p[1]).collect();
    depths.sort_by(|a, b| a.total_cmp(b));
    depths.dedup();
    if depths.len() < 2 {
        return MetricValue::NotApplicable;
    }
    let pitch = depths
        .windows(2)
        .map(|d| d[1] - d[0])
        .fold(f64::INFINITY, f64::min);
    if pitch >= config.max_vertical_pitch_um {
        return MetricValue::NotApplicable;
    }

    let [x0, y0] = channel_positions[peak_channel];
    let mut candidates: Vec<usize> = (0..channel_positions.len())
        .filter(|&ch| (channel_positions[ch][0] - x0).abs() <= config.x_tolerance_um)
        .collect();
    if candidates.len() < config.min_channels {
        return MetricValue::undefined(MetricFailure::insufficient(
            "channels within x tolerance",
            config.min_channels,
            candidates.len(),
        ));
    }
    candidates.sort_by(|&a, &b| {
        let da = (channel_positions[a][1] - y0).abs();
        let db = (channel_positions[b][1] - y0).abs();
        da.total_cmp(&db)
    });
    candidates.truncate(config.num_channels);

    let mut points: Vec<(f64, f64)> = Vec::with_capacity(candidates.len());
    for &ch in &candidates {
        let [x, y] = channel_positions[ch];
        let distance = ((x - x0).powi(2) + (y - y0).powi(2)).sqrt();
        let amplitude = template
            .channel(ch)
            .map(|s| s.iter().fold(0.0f64, |m, v| m.max(v.abs())))
            .unwrap_or(0.0);
        if !amplitude.is_finite() {
            return MetricValue::undefined(MetricFailure::fit(format!(
                "non-finite template on channel {}",
                ch
            )));
        }
        points.push((distance, amplitude));
    }
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let peak_amplitude = points.iter().fold(0.0f64, |m, p| m.max(p.1));
    if peak_amplitude == 0.0 {
        return MetricValue::undefined(MetricFailure::fit("flat template across channels"));
    }

    let (distances, amplitudes): (Vec<f64>, Vec<f64>) = points
        .into_iter()
        .map(|(d, a)| (d, a / peak_amplitude))
        .filter(|&(_, a)| a >= config.min_amplitude_fraction && a > 0.0)
        .unzip();
    if distances.len() < 2 {
        return MetricValue::undefined(MetricFailure::insufficient(
            "channels above the amplitude threshold",
            2,
            distances.len(),
        ));
    }

    let ys: Vec<f64> = match config.fit {
        DecayFit::Linear => amplitudes,
        DecayFit::LogLinear => amplitudes.iter().map(|a| a.ln()).collect(),
    };
    match stats::linear_fit(&distances, &ys) {
        Some((slope, _)) => MetricValue::defined(slope),
        None => MetricValue::undefined(MetricFailure::fit("all fit channels at the same distance")),
    }
}

/// 1 for somatic, 0 for non-somatic. An undefined input never satisfies its comparison.
fn somatic_flag(metrics: &WaveformMetrics, criteria: &NonSomaticCriteria) -> MetricValue {
    let lt = |v: &MetricValue, cutoff: f64| v.value().map_or(false, |x| x < cutoff);
    let gt = |v: &MetricValue, cutoff: f64| v.value().map_or(false, |x| x > cutoff);

    let narrow_axonal = lt(&metrics.trough_to_peak2, criteria.max_trough_to_peak2)
        && lt(&metrics.peak_before_width, criteria.max_peak_before_width)
        && lt(&metrics.trough_width, criteria.max_trough_width)
        && gt(&metrics.peak1_to_peak2, criteria.min_peak1_to_peak2);
    let large_first_peak = gt(&metrics.main_peak_to_trough, criteria.max_main_peak_to_trough);

    MetricValue::from_flag(!(narrow_axonal || large_first_peak))
}

/// Compute every waveform metric of a unit on its peak channel
pub fn extract(
    unit: &Unit,
    peak_channel: usize,
    channel_positions: &[[f64; 2]],
    sample_rate_hz: f64,
    config: &WaveformConfig,
) -> WaveformMetrics {
    let decay_enabled = config.spatial_decay.is_some();
    let somatic_enabled = config.non_somatic.is_some();

    let w = match unit.template.channel(peak_channel) {
        Some(w) => w,
        None => {
            return WaveformMetrics::failed(
                MetricFailure::insufficient("template channels", peak_channel + 1, unit.template.n_channels()),
                decay_enabled,
                somatic_enabled,
            )
        }
    };
    if w.iter().any(|v| !v.is_finite()) {
        log::warn!("Unit {}: non-finite template samples on channel {}", unit.id, peak_channel);
        return WaveformMetrics::failed(
            MetricFailure::fit("non-finite template samples"),
            decay_enabled,
            somatic_enabled,
        );
    }

    let shape = analyze_shape(w, config.min_prominence_fraction);

    let mut metrics = match &shape {
        Ok(s) => {
            let main_peak = s.peak_before.unwrap_or(0.0).max(s.peak_after.unwrap_or(0.0));
            WaveformMetrics {
                n_peaks: MetricValue::from_count(s.n_peaks),
                n_troughs: MetricValue::from_count(s.n_troughs),
                duration_us: peak_trough_duration(w, sample_rate_hz).into(),
                main_peak_to_trough: ratio(Some(main_peak), Some(s.trough)),
                second_peak_to_trough: ratio(s.peak_after, Some(s.trough)),
                peak1_to_peak2: ratio(s.peak_before, s.peak_after),
                trough_to_peak2: ratio(Some(s.trough), s.peak_before),
                peak_before_width: s.peak_before_width.map(MetricValue::defined).unwrap_or_else(|| {
                    MetricValue::undefined(MetricFailure::insufficient(
                        "prominent peaks before the trough",
                        1,
                        0,
                    ))
                }),
                trough_width: s.trough_width.map(MetricValue::defined).unwrap_or_else(|| {
                    MetricValue::undefined(MetricFailure::insufficient("prominent troughs", 1, 0))
                }),
                baseline_flatness: baseline_flatness(w, config.baseline_window).into(),
                template_amplitude: MetricValue::defined(unit.template.peak_to_peak(peak_channel)),
                spatial_decay_slope: MetricValue::NotApplicable,
                signal_to_noise: signal_to_noise(
                    w,
                    unit.noise_samples.as_deref(),
                    config.baseline_window,
                )
                .into(),
                is_somatic: MetricValue::NotApplicable,
            }
        }
        Err(reason) => {
            let mut failed = WaveformMetrics::failed(reason.clone(), decay_enabled, somatic_enabled);
            failed.template_amplitude = MetricValue::defined(unit.template.peak_to_peak(peak_channel));
            failed
        }
    };

    if let Some(decay) = &config.spatial_decay {
        metrics.spatial_decay_slope =
            spatial_decay_slope(&unit.template, peak_channel, channel_positions, decay);
    }

    if let Some(criteria) = &config.non_somatic {
        metrics.is_somatic = match &shape {
            Ok(_) => somatic_flag(&metrics, criteria),
            Err(reason) => MetricValue::undefined(reason.clone()),
        };
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Biphasic spike: small pre-peak, deep trough at sample 30, broad repolarisation peak
    fn biphasic(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                0.05 * (-((t - 24.0) / 2.0).powi(2)).exp() - 1.0 * (-((t - 30.0) / 2.0).powi(2)).exp()
                    + 0.35 * (-((t - 40.0) / 5.0).powi(2)).exp()
            })
            .collect()
    }

    fn unit_with(template: Vec<Vec<f64>>) -> Unit {
        Unit {
            id: 1,
            best_channel: Some(0),
            template: Template(template),
            spike_times: vec![],
            amplitudes: vec![],
            features: None,
            spike_depths: None,
            noise_samples: None,
        }
    }

    #[test]
    fn test_biphasic_shape() {
        let w = biphasic(82);
        let shape = analyze_shape(&w, 0.2).unwrap();
        assert_eq!(shape.n_troughs, 1);
        assert_eq!(shape.n_peaks, 1);
        assert!(shape.trough < -0.9);
        assert!(shape.peak_after.unwrap() > 0.3);
        assert!(shape.trough_width.is_some());
    }

    #[test]
    fn test_duration_in_microseconds() {
        let w = biphasic(82);
        // Trough at 30, largest later peak near 40: ~10 samples at 30 kHz
        let d = peak_trough_duration(&w, 30000.0).unwrap();
        assert!((d - 1e6 * 10.0 / 30000.0).abs() < 1e6 * 1.5 / 30000.0);
    }

    #[test]
    fn test_duration_undefined_without_following_extremum() {
        // Dominant trough is the final sample
        let w = [0.0, 0.1, 0.2, -1.0];
        assert!(peak_trough_duration(&w, 30000.0).is_err());
    }

    #[test]
    fn test_ratio_rules() {
        assert_eq!(ratio(Some(2.0), Some(-4.0)).value(), Some(0.5));
        assert_eq!(ratio(None, Some(-4.0)).value(), Some(0.0));
        assert_eq!(ratio(Some(0.0), Some(-4.0)).value(), Some(0.0));
        assert!(ratio(Some(1.0), Some(0.0)).is_undefined());
        assert!(ratio(Some(1.0), None).is_undefined());
    }

    #[test]
    fn test_non_finite_template_is_undefined() {
        let mut w = biphasic(82);
        w[10] = f64::NAN;
        let unit = unit_with(vec![w]);
        let metrics = extract(&unit, 0, &[[0.0, 0.0]], 30000.0, &WaveformConfig::default());
        assert!(metrics.n_peaks.is_undefined());
        assert!(metrics.duration_us.is_undefined());
        assert!(metrics.signal_to_noise.is_undefined());
        assert!(metrics.is_somatic.is_not_applicable());
    }

    #[test]
    fn test_snr_prefers_noise_samples() {
        let w = biphasic(82);
        let noise = [-0.1, 0.1, -0.1, 0.1];
        let snr = signal_to_noise(&w, Some(&noise), [0, 10]).unwrap();
        let peak = w.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!((snr - peak / 0.1).abs() < 1e-9);

        // Constant noise cannot normalise anything
        assert!(signal_to_noise(&w, Some(&[0.5, 0.5]), [0, 10]).is_err());
    }

    #[test]
    fn test_spatial_decay_log_linear() {
        // 12 channels in one column, 20 µm apart; amplitude halves every 20 µm
        let positions: Vec<[f64; 2]> = (0..12).map(|i| [0.0, 20.0 * i as f64]).collect();
        let base = biphasic(82);
        let template: Vec<Vec<f64>> = (0..12)
            .map(|i| {
                let scale = 0.5f64.powi(i);
                base.iter().map(|v| v * scale).collect()
            })
            .collect();
        let config = SpatialDecayConfig {
            min_amplitude_fraction: 0.0,
            ..SpatialDecayConfig::default()
        };
        let slope = spatial_decay_slope(&Template(template), 0, &positions, &config)
            .value()
            .unwrap();
        assert!((slope - (0.5f64.ln() / 20.0)).abs() < 1e-9);
    }

    #[test]
    fn test_spatial_decay_applicability() {
        let template = Template(vec![biphasic(82); 3]);
        let config = SpatialDecayConfig::default();

        // Single depth
        let flat = [[0.0, 0.0], [16.0, 0.0], [32.0, 0.0]];
        assert!(spatial_decay_slope(&template, 0, &flat, &config).is_not_applicable());

        // 40 µm pitch is too coarse
        let coarse = [[0.0, 0.0], [0.0, 40.0], [0.0, 80.0]];
        assert!(spatial_decay_slope(&template, 0, &coarse, &config).is_not_applicable());

        // Fine pitch but only 3 channels
        let fine = [[0.0, 0.0], [0.0, 20.0], [0.0, 40.0]];
        assert!(spatial_decay_slope(&template, 0, &fine, &config).is_undefined());
    }

    #[test]
    fn test_large_first_peak_is_non_somatic() {
        // Axon-like: dominant positive peak before a shallow trough
        let w: Vec<f64> = (0..82)
            .map(|i| {
                let t = i as f64;
                1.0 * (-((t - 25.0) / 2.0).powi(2)).exp() - 0.3 * (-((t - 32.0) / 2.0).powi(2)).exp()
                    + 0.05 * (-((t - 42.0) / 4.0).powi(2)).exp()
            })
            .collect();
        let unit = unit_with(vec![w]);
        let config = WaveformConfig {
            spatial_decay: None,
            non_somatic: Some(NonSomaticCriteria {
                max_trough_to_peak2: 0.8,
                max_peak_before_width: 150.0,
                max_trough_width: 200.0,
                min_peak1_to_peak2: 3.0,
                max_main_peak_to_trough: 1.5,
            }),
            ..WaveformConfig::default()
        };
        let metrics = extract(&unit, 0, &[[0.0, 0.0]], 30000.0, &config);
        assert!(metrics.main_peak_to_trough.value().unwrap() > 1.5);
        assert_eq!(metrics.is_somatic.value(), Some(0.0));
        assert!(metrics.spatial_decay_slope.is_not_applicable());

        let somatic = extract(&unit_with(vec![biphasic(82)]), 0, &[[0.0, 0.0]], 30000.0, &config);
        assert_eq!(somatic.is_somatic.value(), Some(1.0));
    }
}
