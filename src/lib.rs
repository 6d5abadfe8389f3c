// unitgrade - quality metrics and classification for spike-sorted units
// Module declarations

pub mod classify;
pub mod metrics;
pub mod pipeline;
pub mod state;
pub mod units;

pub use classify::{ClassificationLabel, ClassificationResult, ConfigurationError, LabelAssignment, ThresholdConfig};
pub use metrics::{MetricName, MetricValue, MetricsConfig, QualityMetricsRecord};
pub use pipeline::{relabel, MetricsTable, PipelineError, PipelineOutput, QualityPipeline};
pub use units::{InputDataError, Recording, Unit};
