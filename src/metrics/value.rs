// Tri-state metric values
// A metric cell is defined, undefined (with the recovered failure), or not applicable

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a metric could not be computed for a unit.
/// These failures are recovered locally and stored in the cell, never propagated.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricFailure {
    /// Distribution fit did not converge, covariance was singular, or the input was degenerate
    #[error("numerical fit failure: {detail}")]
    NumericalFit { detail: String },

    /// Too few samples for the metric's minimum requirement
    #[error("insufficient data: need {required} {what}, have {available}")]
    InsufficientData {
        what: String,
        required: usize,
        available: usize,
    },
}

impl MetricFailure {
    pub fn fit(detail: impl Into<String>) -> Self {
        MetricFailure::NumericalFit {
            detail: detail.into(),
        }
    }

    pub fn insufficient(what: impl Into<String>, required: usize, available: usize) -> Self {
        MetricFailure::InsufficientData {
            what: what.into(),
            required,
            available,
        }
    }
}

/// Value of a single metric for a single unit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MetricValue {
    /// Computed, finite value
    Defined { value: f64 },

    /// Computed and failed
    Undefined { reason: MetricFailure },

    /// Not computed for this run (metric disabled or its inputs were not provided)
    #[default]
    NotApplicable,
}

impl MetricValue {
    /// Wrap a computed value. Non-finite results become undefined so NaN never
    /// reaches a threshold comparison.
    pub fn defined(value: f64) -> Self {
        if value.is_finite() {
            MetricValue::Defined { value }
        } else {
            MetricValue::Undefined {
                reason: MetricFailure::fit(format!("non-finite result ({})", value)),
            }
        }
    }

    pub fn undefined(reason: MetricFailure) -> Self {
        MetricValue::Undefined { reason }
    }

    pub fn from_count(count: usize) -> Self {
        MetricValue::Defined {
            value: count as f64,
        }
    }

    pub fn from_flag(flag: bool) -> Self {
        MetricValue::Defined {
            value: if flag { 1.0 } else { 0.0 },
        }
    }

    /// The value, if defined
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Defined { value } => Some(*value),
            _ => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, MetricValue::Defined { .. })
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, MetricValue::Undefined { .. })
    }

    pub fn is_not_applicable(&self) -> bool {
        matches!(self, MetricValue::NotApplicable)
    }

    /// Short state name used by tabular exports
    pub fn state_name(&self) -> &'static str {
        match self {
            MetricValue::Defined { .. } => "defined",
            MetricValue::Undefined { .. } => "undefined",
            MetricValue::NotApplicable => "not_applicable",
        }
    }
}

impl From<Result<f64, MetricFailure>> for MetricValue {
    fn from(result: Result<f64, MetricFailure>) -> Self {
        match result {
            Ok(value) => MetricValue::defined(value),
            Err(reason) => MetricValue::Undefined { reason },
        }
    }
}
