// Quality-metric run
// Validates the input, fans per-unit extraction out over a rayon pool, then computes
// distance metrics against the shared feature space and labels every unit

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::classify::{
    classify_all, ClassificationLabel, ConfigurationError, LabelAssignment, RuleSet, ThresholdConfig,
};
use crate::metrics::{DistanceMetrics, FeatureSpace, MetricsConfig, UnitFeatures};
use crate::pipeline::table::{MetricsTable, TableError, TableSlots};
use crate::pipeline::trace::{Stage, TraceBuilder, TraceEntry, TraceError, TraceWriter};
use crate::units::{validate_recording, InputDataError, Recording};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Input error: {0}")]
    Input(#[from] InputDataError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Metrics table error: {0}")]
    Table(#[from] TableError),
}

/// Metrics table and parallel label assignment of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub metrics: MetricsTable,
    pub labels: Vec<LabelAssignment>,
}

/// Immutable extraction parameters and rules, validated once up front
pub struct QualityPipeline {
    config: MetricsConfig,
    rules: RuleSet,
    trace: Option<TraceWriter>,
}

impl QualityPipeline {
    pub fn new(config: MetricsConfig, thresholds: &ThresholdConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let rules = thresholds.validate()?;
        Ok(QualityPipeline {
            config,
            rules,
            trace: None,
        })
    }

    /// Log stage progress to a JSONL trace file
    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    fn record(&self, entry: TraceEntry) -> Result<(), TraceError> {
        match &self.trace {
            Some(writer) => writer.write(&entry),
            None => Ok(()),
        }
    }

    /// Compute every unit's metrics and label. Either the whole table is produced or the
    /// run fails before any per-unit work.
    pub fn run(&self, recording: &Recording) -> Result<PipelineOutput, PipelineError> {
        let run_id = Uuid::new_v4();

        self.record(TraceBuilder::stage(run_id, Stage::Validation).start("Validating recording"))?;
        validate_recording(recording)?;
        if recording.units.is_empty() && !self.rules.is_empty() {
            return Err(InputDataError::NoUnits {
                rules: self.rules.len(),
            }
            .into());
        }
        self.record(TraceBuilder::stage(run_id, Stage::Validation).complete(format!(
            "{} units on {} channels",
            recording.units.len(),
            recording.n_channels()
        )))?;

        let metrics = match self.config.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
                pool.install(|| self.compute_metrics(run_id, recording))?
            }
            None => self.compute_metrics(run_id, recording)?,
        };

        self.record(TraceBuilder::stage(run_id, Stage::Classification).start("Applying rules"))?;
        let labels = classify_all(metrics.records(), &self.rules);
        let mut counts = serde_json::Map::new();
        for label in ClassificationLabel::ALL {
            let n = labels.iter().filter(|a| a.result.label == label).count();
            counts.insert(label.as_str().to_string(), n.into());
        }
        self.record(
            TraceBuilder::stage(run_id, Stage::Classification)
                .complete_with(format!("Labelled {} units", labels.len()), counts.into()),
        )?;

        log::info!("Run {} finished: {} units labelled", run_id, labels.len());
        Ok(PipelineOutput {
            run_id,
            metrics,
            labels,
        })
    }

    fn compute_metrics(&self, run_id: Uuid, recording: &Recording) -> Result<MetricsTable, PipelineError> {
        let units = &recording.units;

        self.record(TraceBuilder::stage(run_id, Stage::UnitFeatures).start("Extracting per-unit features"))?;
        let features: Vec<UnitFeatures> = units
            .par_iter()
            .map(|unit| UnitFeatures::extract(unit, recording, &self.config))
            .collect();
        self.record(TraceBuilder::stage(run_id, Stage::UnitFeatures).complete(format!(
            "{} units extracted",
            features.len()
        )))?;

        // Every unit's own features are done; the shared index is read-only from here on
        self.record(TraceBuilder::stage(run_id, Stage::DistanceMetrics).start("Building feature space"))?;
        let space = self
            .config
            .distance
            .as_ref()
            .map(|distance| FeatureSpace::build(units, distance));

        let mut slots = TableSlots::new(features.len());
        slots
            .slots_mut()
            .par_iter_mut()
            .zip(features.into_par_iter())
            .enumerate()
            .try_for_each(|(index, (slot, unit))| {
                let distance = match &space {
                    Some(space) => space.unit_metrics(index),
                    None => DistanceMetrics::not_applicable(),
                };
                slot.write(index, unit.into_record(distance))
            })?;
        let table = slots.finish()?;

        let (defined, undefined, not_applicable) = table.state_counts();
        log::info!(
            "Computed metrics for {} units ({} defined, {} undefined, {} not applicable)",
            table.len(),
            defined,
            undefined,
            not_applicable
        );
        self.record(TraceBuilder::stage(run_id, Stage::DistanceMetrics).complete_with(
            "Metrics table complete",
            serde_json::json!({
                "defined": defined,
                "undefined": undefined,
                "not_applicable": not_applicable,
            }),
        ))?;

        Ok(table)
    }
}

/// Label a stored metrics table with new rules. No feature is recomputed.
pub fn relabel(metrics: &MetricsTable, thresholds: &ThresholdConfig) -> Result<Vec<LabelAssignment>, PipelineError> {
    let rules = thresholds.validate()?;
    Ok(classify_all(metrics.records(), &rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Combine, Comparison, MetricCondition, ThresholdRule, UndefinedPolicy};
    use crate::metrics::config::NonSomaticCriteria;
    use crate::metrics::{MetricFailure, MetricName, MetricValue};
    use crate::pipeline::trace::read_trace_file;
    use crate::units::{SpikeFeatures, Template, Unit};
    use tempfile::TempDir;

    const DURATION_S: f64 = 100.0;
    const N_CHANNELS: usize = 4;

    fn lcg(seed: u64) -> impl FnMut() -> f64 {
        let mut state = seed;
        move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 11) as f64) / ((1u64 << 53) as f64)
        }
    }

    /// Small pre-peak, deep trough at sample 30, broad repolarisation peak
    fn biphasic() -> Vec<f64> {
        (0..82)
            .map(|i| {
                let t = i as f64;
                0.05 * (-((t - 24.0) / 2.0).powi(2)).exp() - 1.0 * (-((t - 30.0) / 2.0).powi(2)).exp()
                    + 0.35 * (-((t - 40.0) / 5.0).powi(2)).exp()
            })
            .collect()
    }

    /// Dominant positive peak ahead of a shallow trough and a long flat tail
    fn axonal() -> Vec<f64> {
        (0..82)
            .map(|i| {
                let t = i as f64;
                1.0 * (-((t - 25.0) / 2.0).powi(2)).exp() - 0.3 * (-((t - 32.0) / 2.0).powi(2)).exp()
                    + 0.05 * (-((t - 42.0) / 4.0).powi(2)).exp()
            })
            .collect()
    }

    /// Same shape on every channel, no decay with distance
    fn template(w: Vec<f64>) -> Template {
        Template(vec![w; N_CHANNELS])
    }

    /// `n` spikes spread evenly over the recording with jitter well above any refractory period
    fn regular_train(n: usize, seed: u64) -> Vec<f64> {
        let mut next = lcg(seed);
        let step = DURATION_S / n as f64;
        (0..n)
            .map(|i| step * (i as f64 + 0.5) + step * 0.4 * (next() - 0.5))
            .collect()
    }

    fn amplitudes(n: usize, seed: u64) -> Vec<f64> {
        let mut next = lcg(seed);
        (0..n)
            .map(|_| 100.0 + 10.0 * ((0..12).map(|_| next()).sum::<f64>() - 6.0))
            .collect()
    }

    /// Spikes on channels 0 and 1, three components each, spread uniformly around `center`
    fn features(n: usize, center: f64, seed: u64) -> SpikeFeatures {
        let mut next = lcg(seed);
        SpikeFeatures {
            channels: vec![0, 1],
            n_components: 3,
            values: (0..n)
                .map(|_| (0..6).map(|_| center + 2.0 * (next() - 0.5)).collect())
                .collect(),
        }
    }

    fn unit(id: u32, w: Vec<f64>, spike_times: Vec<f64>, features: Option<SpikeFeatures>) -> Unit {
        let n = spike_times.len();
        Unit {
            id,
            best_channel: Some(0),
            template: template(w),
            spike_times,
            amplitudes: amplitudes(n, id as u64 + 100),
            features,
            spike_depths: None,
            noise_samples: None,
        }
    }

    /// Clean unit (scenario A)
    fn clean_unit() -> Unit {
        unit(1, biphasic(), regular_train(500, 1), Some(features(500, 0.0, 11)))
    }

    /// Well-separated neighbour sharing channels with the clean unit
    fn neighbour_unit() -> Unit {
        unit(2, biphasic(), regular_train(600, 2), Some(features(600, 20.0, 12)))
    }

    /// Axon-like waveform with clean separability (scenario C)
    fn axonal_unit() -> Unit {
        unit(3, axonal(), regular_train(500, 3), Some(features(500, -20.0, 13)))
    }

    /// Three spikes only (scenario B)
    fn sparse_unit() -> Unit {
        unit(4, biphasic(), vec![10.0, 50.0, 90.0], None)
    }

    /// Bursts of refractory violations confined to the first 10 s (scenario D)
    fn noisy_unit() -> Unit {
        let times: Vec<f64> = (0..250)
            .flat_map(|k| {
                let t = 0.04 * k as f64;
                [t, t + 0.001]
            })
            .collect();
        unit(5, biphasic(), times, None)
    }

    fn recording(units: Vec<Unit>) -> Recording {
        Recording {
            duration_s: DURATION_S,
            sample_rate_hz: 30000.0,
            channel_positions: (0..N_CHANNELS).map(|i| [0.0, 20.0 * i as f64]).collect(),
            units,
        }
    }

    fn config() -> MetricsConfig {
        let mut config = MetricsConfig::default();
        config.presence.bin_s = 10.0;
        config.waveform.non_somatic = Some(NonSomaticCriteria {
            max_trough_to_peak2: 0.8,
            max_peak_before_width: 150.0,
            max_trough_width: 200.0,
            min_peak1_to_peak2: 3.0,
            max_main_peak_to_trough: 1.5,
        });
        config
    }

    fn rule(id: &str, label: ClassificationLabel, priority: u32, metric: &str, op: Comparison, cutoff: f64) -> ThresholdRule {
        ThresholdRule {
            id: id.to_string(),
            label,
            priority,
            combine: Combine::All,
            conditions: vec![MetricCondition {
                metric: metric.to_string(),
                op,
                cutoff,
                on_undefined: UndefinedPolicy::Passes,
            }],
        }
    }

    /// Noise first, then non-somatic, then contamination and isolation
    fn thresholds() -> ThresholdConfig {
        ThresholdConfig {
            rules: vec![
                rule("noise_presence", ClassificationLabel::Noise, 1, "presence_ratio", Comparison::Lt, 0.7),
                rule("non_somatic", ClassificationLabel::NonSomatic, 2, "is_somatic", Comparison::Eq, 0.0),
                rule("mua_rpv", ClassificationLabel::MultiUnit, 3, "fraction_rpv", Comparison::Gt, 0.1),
                rule("mua_isolation", ClassificationLabel::MultiUnit, 4, "isolation_distance", Comparison::Lt, 20.0),
                rule("mua_missing", ClassificationLabel::MultiUnit, 5, "percent_missing", Comparison::Gt, 50.0),
            ],
        }
    }

    fn full_recording() -> Recording {
        recording(vec![
            clean_unit(),
            neighbour_unit(),
            axonal_unit(),
            sparse_unit(),
            noisy_unit(),
        ])
    }

    fn label_of(output: &PipelineOutput, unit_id: u32) -> &LabelAssignment {
        output.labels.iter().find(|l| l.unit_id == unit_id).unwrap()
    }

    #[test]
    fn test_clean_unit_is_single_unit() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();
        let record = output.metrics.get(1).unwrap();

        assert_eq!(record.get(MetricName::NSpikes).value(), Some(500.0));
        assert!((record.get(MetricName::FiringRate).value().unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(record.get(MetricName::FractionRpv).value(), Some(0.0));
        assert_eq!(record.get(MetricName::PresenceRatio).value(), Some(1.0));
        assert_eq!(record.get(MetricName::IsSomatic).value(), Some(1.0));
        assert!(record.get(MetricName::IsolationDistance).value().unwrap() > 100.0);
        assert!(record.get(MetricName::LRatio).value().unwrap() < 0.01);

        let label = label_of(&output, 1);
        assert_eq!(label.result.label, ClassificationLabel::SingleUnit);
        assert!(label.result.rule_id.is_none());
    }

    #[test]
    fn test_sparse_unit_still_labelled() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();
        let record = output.metrics.get(4).unwrap();

        assert!(matches!(
            record.get(MetricName::PercentMissing),
            MetricValue::Undefined {
                reason: MetricFailure::InsufficientData { .. }
            }
        ));
        assert!(record.get(MetricName::IsolationDistance).is_not_applicable());

        // Three spikes touch 3 of 10 presence bins
        let label = label_of(&output, 4);
        assert_eq!(label.result.label, ClassificationLabel::Noise);
        assert_eq!(label.result.rule_id.as_deref(), Some("noise_presence"));
    }

    #[test]
    fn test_axonal_unit_is_non_somatic_despite_separation() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();
        let record = output.metrics.get(3).unwrap();

        assert_eq!(record.get(MetricName::IsSomatic).value(), Some(0.0));
        assert!(record.get(MetricName::IsolationDistance).value().unwrap() > 100.0);
        assert_eq!(record.get(MetricName::FractionRpv).value(), Some(0.0));

        let label = label_of(&output, 3);
        assert_eq!(label.result.label, ClassificationLabel::NonSomatic);
        assert_eq!(label.result.rule_id.as_deref(), Some("non_somatic"));
    }

    #[test]
    fn test_noise_outranks_non_somatic() {
        // Axon-like waveform that only fires during the first 20 s
        let times: Vec<f64> = (0..200).map(|i| 0.05 + 0.1 * i as f64).collect();
        let absent_axon = unit(6, axonal(), times, None);
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&recording(vec![absent_axon])).unwrap();
        let record = output.metrics.get(6).unwrap();

        assert_eq!(record.get(MetricName::IsSomatic).value(), Some(0.0));
        assert_eq!(record.get(MetricName::PresenceRatio).value(), Some(0.2));

        let label = label_of(&output, 6);
        assert_eq!(label.result.label, ClassificationLabel::Noise);
        assert_eq!(label.result.rule_id.as_deref(), Some("noise_presence"));
    }

    #[test]
    fn test_absent_contaminated_unit_is_noise() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();
        let record = output.metrics.get(5).unwrap();

        assert!(record.get(MetricName::PresenceRatio).value().unwrap() < 0.7);
        assert!(record.get(MetricName::FractionRpv).value().unwrap() > 0.1);

        // Both noise and contamination rules hold; noise is checked first
        let label = label_of(&output, 5);
        assert_eq!(label.result.label, ClassificationLabel::Noise);
        assert_eq!(label.result.rule_id.as_deref(), Some("noise_presence"));
    }

    #[test]
    fn test_table_and_labels_follow_input_order() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();
        assert_eq!(output.metrics.unit_ids(), vec![1, 2, 3, 4, 5]);
        let label_ids: Vec<u32> = output.labels.iter().map(|l| l.unit_id).collect();
        assert_eq!(label_ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fixed_thread_count_matches_default_pool() {
        let recording = full_recording();
        let default = QualityPipeline::new(config(), &thresholds()).unwrap();
        let mut single = config();
        single.threads = Some(1);
        let single = QualityPipeline::new(single, &thresholds()).unwrap();

        let a = default.run(&recording).unwrap();
        let b = single.run(&recording).unwrap();
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_relabel_uses_stored_metrics_only() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();

        let same = relabel(&output.metrics, &thresholds()).unwrap();
        assert_eq!(same, output.labels);

        // Drop the noise rule: the contaminated unit falls through to the contamination rule
        let mut changed = thresholds();
        changed.rules.retain(|r| r.id != "noise_presence");
        let relabelled = relabel(&output.metrics, &changed).unwrap();
        let unit5 = relabelled.iter().find(|l| l.unit_id == 5).unwrap();
        assert_eq!(unit5.result.label, ClassificationLabel::MultiUnit);
        assert_eq!(unit5.result.rule_id.as_deref(), Some("mua_rpv"));
    }

    #[test]
    fn test_disabled_distance_metrics_are_not_applicable() {
        let mut config = config();
        config.distance = None;
        config.drift = None;
        let pipeline = QualityPipeline::new(config, &thresholds()).unwrap();
        let output = pipeline.run(&full_recording()).unwrap();
        for record in output.metrics.records() {
            assert!(record.get(MetricName::IsolationDistance).is_not_applicable());
            assert!(record.get(MetricName::SilhouetteScore).is_not_applicable());
            assert!(record.get(MetricName::MaxDrift).is_not_applicable());
        }
    }

    #[test]
    fn test_degenerate_units_do_not_fail_the_run() {
        let empty = unit(7, biphasic(), vec![], None);
        let single = unit(8, vec![0.0; 82], vec![42.0], None);
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let output = pipeline.run(&recording(vec![empty, single])).unwrap();

        assert_eq!(output.labels.len(), 2);
        let flat = output.metrics.get(8).unwrap();
        assert!(flat.get(MetricName::WaveformDuration).is_undefined());
        assert_eq!(flat.get(MetricName::NSpikes).value(), Some(1.0));
        assert!(output.metrics.get(7).unwrap().get(MetricName::AcgRefractoryRatio).is_undefined());
    }

    #[test]
    fn test_no_units_with_rules_is_fatal() {
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let err = pipeline.run(&recording(vec![])).unwrap_err();
        assert!(matches!(err, PipelineError::Input(InputDataError::NoUnits { rules: 5 })));

        let no_rules = QualityPipeline::new(config(), &ThresholdConfig::default()).unwrap();
        assert!(no_rules.run(&recording(vec![])).unwrap().labels.is_empty());
    }

    #[test]
    fn test_invalid_input_fails_before_extraction() {
        let mut bad = clean_unit();
        bad.amplitudes.pop();
        let pipeline = QualityPipeline::new(config(), &thresholds()).unwrap();
        let err = pipeline.run(&recording(vec![bad])).unwrap_err();
        assert!(matches!(err, PipelineError::Input(InputDataError::LengthMismatch { .. })));
    }

    #[test]
    fn test_invalid_rules_rejected_up_front() {
        let mut rules = thresholds();
        rules.rules[0].conditions[0].metric = "somatic".to_string();
        assert!(matches!(
            QualityPipeline::new(config(), &rules),
            Err(PipelineError::Config(ConfigurationError::UnknownMetric { .. }))
        ));
    }

    #[test]
    fn test_trace_records_every_stage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trace.jsonl");
        let pipeline = QualityPipeline::new(config(), &thresholds())
            .unwrap()
            .with_trace(TraceWriter::new(path.clone()));
        let output = pipeline.run(&full_recording()).unwrap();

        let entries = read_trace_file(&path).unwrap();
        assert!(entries.iter().all(|e| e.run_id == output.run_id));
        for stage in [
            Stage::Validation,
            Stage::UnitFeatures,
            Stage::DistanceMetrics,
            Stage::Classification,
        ] {
            assert!(entries.iter().any(|e| e.stage == stage && e.progress == 1.0));
        }
        let last = entries.last().unwrap();
        assert_eq!(last.data.as_ref().unwrap()["non_somatic"], 1);
    }
}
