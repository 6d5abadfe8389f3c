// Per-unit quality metrics record
// Fixed, enumerated metric names and the record that holds one value per name

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::metrics::value::MetricValue;

/// Every metric the pipeline can produce.
/// Threshold rules reference these by their snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    NSpikes,
    FiringRate,
    PresenceRatio,
    FractionRpv,
    PercentMissing,
    IsolationDistance,
    LRatio,
    SilhouetteScore,
    WaveformDuration,
    PeakToTroughRatio,
    NPeaks,
    NTroughs,
    SpatialDecaySlope,
    SignalToNoiseRatio,
    IsSomatic,
    TemplateAmplitude,
    BaselineFlatness,
    SecondPeakToTroughRatio,
    Peak1ToPeak2Ratio,
    TroughToPeak2Ratio,
    PeakBeforeWidth,
    TroughWidth,
    AcgRefractoryRatio,
    MaxDrift,
    CumulativeDrift,
}

pub const METRIC_COUNT: usize = 25;

impl MetricName {
    /// All metrics in column order
    pub const ALL: [MetricName; METRIC_COUNT] = [
        MetricName::NSpikes,
        MetricName::FiringRate,
        MetricName::PresenceRatio,
        MetricName::FractionRpv,
        MetricName::PercentMissing,
        MetricName::IsolationDistance,
        MetricName::LRatio,
        MetricName::SilhouetteScore,
        MetricName::WaveformDuration,
        MetricName::PeakToTroughRatio,
        MetricName::NPeaks,
        MetricName::NTroughs,
        MetricName::SpatialDecaySlope,
        MetricName::SignalToNoiseRatio,
        MetricName::IsSomatic,
        MetricName::TemplateAmplitude,
        MetricName::BaselineFlatness,
        MetricName::SecondPeakToTroughRatio,
        MetricName::Peak1ToPeak2Ratio,
        MetricName::TroughToPeak2Ratio,
        MetricName::PeakBeforeWidth,
        MetricName::TroughWidth,
        MetricName::AcgRefractoryRatio,
        MetricName::MaxDrift,
        MetricName::CumulativeDrift,
    ];

    /// Column name (snake_case, matches the serde representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::NSpikes => "n_spikes",
            MetricName::FiringRate => "firing_rate",
            MetricName::PresenceRatio => "presence_ratio",
            MetricName::FractionRpv => "fraction_rpv",
            MetricName::PercentMissing => "percent_missing",
            MetricName::IsolationDistance => "isolation_distance",
            MetricName::LRatio => "l_ratio",
            MetricName::SilhouetteScore => "silhouette_score",
            MetricName::WaveformDuration => "waveform_duration",
            MetricName::PeakToTroughRatio => "peak_to_trough_ratio",
            MetricName::NPeaks => "n_peaks",
            MetricName::NTroughs => "n_troughs",
            MetricName::SpatialDecaySlope => "spatial_decay_slope",
            MetricName::SignalToNoiseRatio => "signal_to_noise_ratio",
            MetricName::IsSomatic => "is_somatic",
            MetricName::TemplateAmplitude => "template_amplitude",
            MetricName::BaselineFlatness => "baseline_flatness",
            MetricName::SecondPeakToTroughRatio => "second_peak_to_trough_ratio",
            MetricName::Peak1ToPeak2Ratio => "peak1_to_peak2_ratio",
            MetricName::TroughToPeak2Ratio => "trough_to_peak2_ratio",
            MetricName::PeakBeforeWidth => "peak_before_width",
            MetricName::TroughWidth => "trough_width",
            MetricName::AcgRefractoryRatio => "acg_refractory_ratio",
            MetricName::MaxDrift => "max_drift",
            MetricName::CumulativeDrift => "cumulative_drift",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a metric name does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetric(pub String);

impl fmt::Display for UnknownMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown metric '{}'", self.0)
    }
}

impl std::error::Error for UnknownMetric {}

impl FromStr for MetricName {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// One value per metric, addressed by [`MetricName`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<MetricName, MetricValue>",
    into = "BTreeMap<MetricName, MetricValue>"
)]
pub struct MetricMap {
    values: Vec<MetricValue>,
}

impl MetricMap {
    fn new() -> Self {
        MetricMap {
            values: vec![MetricValue::NotApplicable; METRIC_COUNT],
        }
    }

    pub fn get(&self, name: MetricName) -> &MetricValue {
        &self.values[name.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricName, &MetricValue)> {
        MetricName::ALL.iter().copied().zip(self.values.iter())
    }
}

impl From<BTreeMap<MetricName, MetricValue>> for MetricMap {
    fn from(map: BTreeMap<MetricName, MetricValue>) -> Self {
        let mut metrics = MetricMap::new();
        for (name, value) in map {
            metrics.values[name.index()] = value;
        }
        metrics
    }
}

impl From<MetricMap> for BTreeMap<MetricName, MetricValue> {
    fn from(metrics: MetricMap) -> Self {
        MetricName::ALL.iter().copied().zip(metrics.values).collect()
    }
}

/// Quality metrics for one unit.
/// Built once by [`RecordBuilder`]; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetricsRecord {
    pub unit_id: u32,
    pub peak_channel: usize,
    metrics: MetricMap,
}

impl QualityMetricsRecord {
    pub fn get(&self, name: MetricName) -> &MetricValue {
        self.metrics.get(name)
    }

    pub fn metrics(&self) -> &MetricMap {
        &self.metrics
    }

    /// Number of metrics in each state: (defined, undefined, not applicable)
    pub fn state_counts(&self) -> (usize, usize, usize) {
        self.metrics.iter().fold((0, 0, 0), |(d, u, n), (_, v)| match v {
            MetricValue::Defined { .. } => (d + 1, u, n),
            MetricValue::Undefined { .. } => (d, u + 1, n),
            MetricValue::NotApplicable => (d, u, n + 1),
        })
    }
}

/// Assembles a record; anything not set stays not-applicable
pub struct RecordBuilder {
    unit_id: u32,
    peak_channel: usize,
    metrics: MetricMap,
}

impl RecordBuilder {
    pub fn new(unit_id: u32, peak_channel: usize) -> Self {
        RecordBuilder {
            unit_id,
            peak_channel,
            metrics: MetricMap::new(),
        }
    }

    pub fn set(mut self, name: MetricName, value: MetricValue) -> Self {
        self.metrics.values[name.index()] = value;
        self
    }

    pub fn build(self) -> QualityMetricsRecord {
        QualityMetricsRecord {
            unit_id: self.unit_id,
            peak_channel: self.peak_channel,
            metrics: self.metrics,
        }
    }
}
