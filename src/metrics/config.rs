// Metric extraction parameters
// Immutable, serde-loaded settings for every feature extractor, validated before a run starts

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::classify::ConfigurationError;

/// Refractory-violation estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpvMethod {
    /// Consecutive inter-spike intervals, Poisson-null quadratic
    #[default]
    Hill,
    /// All spike pairs inside the refractory window
    Llobet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefractoryConfig {
    /// Candidate refractory periods in seconds; the least contaminated one is reported
    pub tau_r_s: Vec<f64>,

    /// Censored period in seconds (no spike pair can be detected below it)
    pub tau_c_s: f64,

    pub method: RpvMethod,
}

impl Default for RefractoryConfig {
    fn default() -> Self {
        RefractoryConfig {
            tau_r_s: vec![0.002],
            tau_c_s: 0.0001,
            method: RpvMethod::Hill,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Bin length in seconds
    pub bin_s: f64,

    /// When set, a bin only counts as present if it holds at least
    /// `max(1, fraction × p90(bin counts))` spikes
    pub min_bin_fraction: Option<f64>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            bin_s: 60.0,
            min_bin_fraction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplitudeConfig {
    /// Histogram bins for the amplitude distribution
    pub n_bins: usize,

    /// Fewest spikes the Gaussian fit is attempted with
    pub min_spikes: usize,

    /// Outliers above `p99 + factor × (p99 - p1)` are dropped before binning
    pub outlier_factor: f64,

    /// Levenberg-Marquardt iteration limit
    pub max_iterations: usize,
}

impl Default for AmplitudeConfig {
    fn default() -> Self {
        AmplitudeConfig {
            n_bins: 50,
            min_spikes: 6,
            outlier_factor: 10.0,
            max_iterations: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcgConfig {
    pub bin_s: f64,
    pub window_s: f64,
}

impl Default for AcgConfig {
    fn default() -> Self {
        AcgConfig {
            bin_s: 0.0005,
            window_s: 0.05,
        }
    }
}

/// Good-time-window selection. Cutoffs have no defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeChunkConfig {
    /// Chunk length in seconds
    pub chunk_s: f64,

    /// A chunk is kept when its percent missing is below this
    pub max_percent_missing: f64,

    /// ...and its refractory-violation fraction is below this
    pub max_rpv: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayFit {
    /// Slope of normalized amplitude vs distance
    Linear,
    /// Slope of log amplitude vs distance (exponential decay constant)
    #[default]
    LogLinear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialDecayConfig {
    /// Channels further than this from the peak channel in x (µm) are ignored
    pub x_tolerance_um: f64,

    /// Nearest channels in depth used for the fit
    pub num_channels: usize,

    /// Fewer candidate channels than this gives an undefined slope
    pub min_channels: usize,

    /// Not applicable when the probe's vertical pitch is at or above this (µm)
    pub max_vertical_pitch_um: f64,

    /// Channels below this fraction of the peak amplitude are dropped
    pub min_amplitude_fraction: f64,

    pub fit: DecayFit,
}

impl Default for SpatialDecayConfig {
    fn default() -> Self {
        SpatialDecayConfig {
            x_tolerance_um: 33.0,
            num_channels: 10,
            min_channels: 8,
            max_vertical_pitch_um: 30.0,
            min_amplitude_fraction: 0.05,
            fit: DecayFit::LogLinear,
        }
    }
}

/// Cutoffs of the non-somatic waveform test:
/// non-somatic when (trough/peak2 < a ∧ peak1 width < b ∧ trough width < c ∧ peak1/peak2 > d)
/// ∨ main peak/trough > e
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonSomaticCriteria {
    pub max_trough_to_peak2: f64,
    pub max_peak_before_width: f64,
    pub max_trough_width: f64,
    pub min_peak1_to_peak2: f64,
    pub max_main_peak_to_trough: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformConfig {
    /// Minimum peak/trough prominence as a fraction of max |waveform|
    pub min_prominence_fraction: f64,

    /// Template sample range `[start, end)` treated as baseline
    pub baseline_window: [usize; 2],

    /// `None` disables the spatial decay slope
    pub spatial_decay: Option<SpatialDecayConfig>,

    /// `None` leaves the somatic flag not applicable
    pub non_somatic: Option<NonSomaticCriteria>,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        WaveformConfig {
            min_prominence_fraction: 0.2,
            baseline_window: [20, 30],
            spatial_decay: Some(SpatialDecayConfig::default()),
            non_somatic: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    /// Leading feature channels of each unit that span its feature space
    pub n_channels: usize,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        DistanceConfig { n_channels: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Time bin for the median depth estimate, in seconds
    pub bin_s: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig { bin_s: 60.0 }
    }
}

/// Parameters for every feature extractor.
/// Disabled (`None`) sections leave their metrics not applicable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub refractory: RefractoryConfig,
    pub presence: PresenceConfig,
    pub amplitude: AmplitudeConfig,
    pub acg: AcgConfig,
    pub waveform: WaveformConfig,
    pub time_chunks: Option<TimeChunkConfig>,
    pub distance: Option<DistanceConfig>,
    pub drift: Option<DriftConfig>,

    /// Worker threads; `None` uses one per core
    pub threads: Option<usize>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            refractory: RefractoryConfig::default(),
            presence: PresenceConfig::default(),
            amplitude: AmplitudeConfig::default(),
            acg: AcgConfig::default(),
            waveform: WaveformConfig::default(),
            time_chunks: None,
            distance: Some(DistanceConfig::default()),
            drift: Some(DriftConfig::default()),
            threads: None,
        }
    }
}

fn invalid(name: &str, detail: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidParameter {
        name: name.to_string(),
        detail: detail.into(),
    }
}

fn require_positive(name: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, format!("must be a positive number, got {}", value)))
    }
}

fn require_finite(name: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid(name, format!("must be finite, got {}", value)))
    }
}

impl MetricsConfig {
    /// Load parameters from a JSON file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path)?;
        let config: MetricsConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameters no extractor can work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let r = &self.refractory;
        if r.tau_r_s.is_empty() {
            return Err(invalid("refractory.tau_r_s", "at least one value required"));
        }
        require_finite("refractory.tau_c_s", r.tau_c_s)?;
        if r.tau_c_s < 0.0 {
            return Err(invalid("refractory.tau_c_s", "must not be negative"));
        }
        for &tau_r in &r.tau_r_s {
            require_positive("refractory.tau_r_s", tau_r)?;
            if tau_r <= r.tau_c_s {
                return Err(invalid(
                    "refractory.tau_r_s",
                    format!("{} is not above tau_c_s ({})", tau_r, r.tau_c_s),
                ));
            }
        }

        require_positive("presence.bin_s", self.presence.bin_s)?;
        if let Some(fraction) = self.presence.min_bin_fraction {
            require_finite("presence.min_bin_fraction", fraction)?;
            if fraction < 0.0 {
                return Err(invalid("presence.min_bin_fraction", "must not be negative"));
            }
        }

        let a = &self.amplitude;
        if a.n_bins < 3 {
            return Err(invalid("amplitude.n_bins", "need at least 3 bins"));
        }
        if a.min_spikes < 2 {
            return Err(invalid("amplitude.min_spikes", "need at least 2 spikes"));
        }
        require_finite("amplitude.outlier_factor", a.outlier_factor)?;
        if a.max_iterations == 0 {
            return Err(invalid("amplitude.max_iterations", "must be positive"));
        }

        require_positive("acg.bin_s", self.acg.bin_s)?;
        require_positive("acg.window_s", self.acg.window_s)?;
        if self.acg.window_s < 2.0 * self.acg.bin_s {
            return Err(invalid("acg.window_s", "must span at least two bins"));
        }

        let w = &self.waveform;
        require_finite("waveform.min_prominence_fraction", w.min_prominence_fraction)?;
        if !(0.0..=1.0).contains(&w.min_prominence_fraction) {
            return Err(invalid("waveform.min_prominence_fraction", "must be within [0, 1]"));
        }
        if w.baseline_window[0] >= w.baseline_window[1] {
            return Err(invalid("waveform.baseline_window", "start must be before end"));
        }
        if let Some(decay) = &w.spatial_decay {
            require_positive("waveform.spatial_decay.x_tolerance_um", decay.x_tolerance_um)?;
            require_positive(
                "waveform.spatial_decay.max_vertical_pitch_um",
                decay.max_vertical_pitch_um,
            )?;
            require_finite(
                "waveform.spatial_decay.min_amplitude_fraction",
                decay.min_amplitude_fraction,
            )?;
            if decay.min_channels < 2 {
                return Err(invalid("waveform.spatial_decay.min_channels", "need at least 2"));
            }
            if decay.num_channels < decay.min_channels {
                return Err(invalid(
                    "waveform.spatial_decay.num_channels",
                    "must not be below min_channels",
                ));
            }
        }
        if let Some(c) = &w.non_somatic {
            require_finite("waveform.non_somatic.max_trough_to_peak2", c.max_trough_to_peak2)?;
            require_finite("waveform.non_somatic.max_peak_before_width", c.max_peak_before_width)?;
            require_finite("waveform.non_somatic.max_trough_width", c.max_trough_width)?;
            require_finite("waveform.non_somatic.min_peak1_to_peak2", c.min_peak1_to_peak2)?;
            require_finite(
                "waveform.non_somatic.max_main_peak_to_trough",
                c.max_main_peak_to_trough,
            )?;
        }

        if let Some(chunks) = &self.time_chunks {
            require_positive("time_chunks.chunk_s", chunks.chunk_s)?;
            require_finite("time_chunks.max_percent_missing", chunks.max_percent_missing)?;
            require_finite("time_chunks.max_rpv", chunks.max_rpv)?;
        }

        if let Some(distance) = &self.distance {
            if distance.n_channels == 0 {
                return Err(invalid("distance.n_channels", "must be positive"));
            }
        }

        if let Some(drift) = &self.drift {
            require_positive("drift.bin_s", drift.bin_s)?;
        }

        if self.threads == Some(0) {
            return Err(invalid("threads", "must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(MetricsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{ "refractory": { "tau_r_s": [0.0015, 0.002] } }"#).unwrap();
        assert_eq!(config.refractory.tau_r_s, vec![0.0015, 0.002]);
        assert_eq!(config.refractory.tau_c_s, 0.0001);
        assert_eq!(config.presence.bin_s, 60.0);
        assert!(config.distance.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disable_sections_with_null() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{ "distance": null, "drift": null }"#).unwrap();
        assert!(config.distance.is_none());
        assert!(config.drift.is_none());
    }

    #[test]
    fn test_tau_r_must_exceed_tau_c() {
        let mut config = MetricsConfig::default();
        config.refractory.tau_r_s = vec![0.00005];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refractory.tau_r_s"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = MetricsConfig::default();
        config.acg.bin_s = 0.0;
        assert!(config.validate().is_err());

        let mut config = MetricsConfig::default();
        config.waveform.baseline_window = [30, 20];
        assert!(config.validate().is_err());

        let mut config = MetricsConfig::default();
        config.threads = Some(0);
        assert!(config.validate().is_err());
    }
}
