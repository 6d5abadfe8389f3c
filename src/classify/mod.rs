// Classification module
// Threshold rules and the first-match decision engine that labels each unit

pub mod config;
pub mod engine;
pub mod types;

pub use config::{
    Combine, Comparison, ConfigurationError, MetricCondition, RuleSet, ThresholdConfig, ThresholdRule,
    UndefinedPolicy,
};
pub use engine::{classify, classify_all};
pub use types::{ClassificationLabel, ClassificationResult, LabelAssignment};
