// Metrics module
// Per-unit feature extraction and the quality metrics record it produces

pub mod acg;
pub mod config;
pub mod distance;
pub mod drift;
pub mod fit;
pub mod linalg;
pub mod peaks;
pub mod record;
pub mod spike_train;
pub mod stats;
pub mod value;
pub mod waveform;

pub use acg::Autocorrelogram;
pub use config::MetricsConfig;
pub use distance::{DistanceMetrics, FeatureSpace};
pub use record::{MetricName, QualityMetricsRecord, RecordBuilder, UnknownMetric, METRIC_COUNT};
pub use value::{MetricFailure, MetricValue};

use crate::units::{Recording, Unit};
use spike_train::SpikeTrainMetrics;
use waveform::WaveformMetrics;

/// Everything about a unit that only depends on the unit itself
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFeatures {
    pub unit_id: u32,
    pub peak_channel: usize,
    pub spike_train: SpikeTrainMetrics,
    pub waveform: WaveformMetrics,
    pub acg_refractory_ratio: MetricValue,
    pub max_drift: MetricValue,
    pub cumulative_drift: MetricValue,
}

impl UnitFeatures {
    /// Run the autocorrelogram, spike-train, waveform and drift extractors on one unit.
    /// Never fails: problems become undefined values.
    pub fn extract(unit: &Unit, recording: &Recording, config: &MetricsConfig) -> Self {
        let peak_channel = unit.peak_channel().unwrap_or(0);

        let spike_train = spike_train::extract(
            &unit.spike_times,
            &unit.amplitudes,
            recording.duration_s,
            config,
        );

        let acg = Autocorrelogram::compute(&unit.spike_times, config.acg.bin_s, config.acg.window_s);
        let refractory = config
            .refractory
            .tau_r_s
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let acg_refractory_ratio = acg.refractory_ratio(refractory).into();

        let waveform = waveform::extract(
            unit,
            peak_channel,
            &recording.channel_positions,
            recording.sample_rate_hz,
            &config.waveform,
        );

        let (max_drift, cumulative_drift) = match &config.drift {
            Some(drift) => drift::extract(unit, &recording.channel_positions, drift),
            None => (MetricValue::NotApplicable, MetricValue::NotApplicable),
        };

        UnitFeatures {
            unit_id: unit.id,
            peak_channel,
            spike_train,
            waveform,
            acg_refractory_ratio,
            max_drift,
            cumulative_drift,
        }
    }

    /// Combine with the unit's distance metrics into its final record
    pub fn into_record(self, distance: DistanceMetrics) -> QualityMetricsRecord {
        let s = self.spike_train;
        let w = self.waveform;

        RecordBuilder::new(self.unit_id, self.peak_channel)
            .set(MetricName::NSpikes, s.n_spikes)
            .set(MetricName::FiringRate, s.firing_rate)
            .set(MetricName::PresenceRatio, s.presence_ratio)
            .set(MetricName::FractionRpv, s.fraction_rpv)
            .set(MetricName::PercentMissing, s.percent_missing)
            .set(MetricName::IsolationDistance, distance.isolation_distance)
            .set(MetricName::LRatio, distance.l_ratio)
            .set(MetricName::SilhouetteScore, distance.silhouette)
            .set(MetricName::WaveformDuration, w.duration_us)
            .set(MetricName::PeakToTroughRatio, w.main_peak_to_trough)
            .set(MetricName::NPeaks, w.n_peaks)
            .set(MetricName::NTroughs, w.n_troughs)
            .set(MetricName::SpatialDecaySlope, w.spatial_decay_slope)
            .set(MetricName::SignalToNoiseRatio, w.signal_to_noise)
            .set(MetricName::IsSomatic, w.is_somatic)
            .set(MetricName::TemplateAmplitude, w.template_amplitude)
            .set(MetricName::BaselineFlatness, w.baseline_flatness)
            .set(MetricName::SecondPeakToTroughRatio, w.second_peak_to_trough)
            .set(MetricName::Peak1ToPeak2Ratio, w.peak1_to_peak2)
            .set(MetricName::TroughToPeak2Ratio, w.trough_to_peak2)
            .set(MetricName::PeakBeforeWidth, w.peak_before_width)
            .set(MetricName::TroughWidth, w.trough_width)
            .set(MetricName::AcgRefractoryRatio, self.acg_refractory_ratio)
            .set(MetricName::MaxDrift, self.max_drift)
            .set(MetricName::CumulativeDrift, self.cumulative_drift)
            .build()
    }
}
