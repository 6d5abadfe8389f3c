// Data models for run persistence
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored metrics computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub input_path: String,
    pub input_sha256: String,
    /// Extraction parameters as JSON
    pub params_json: String,
    pub crate_version: String,
    pub n_units: i64,
}

/// One application of a threshold config to a run's metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSet {
    pub id: Uuid,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub thresholds_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: Run,
    pub label_set_count: i64,
}
