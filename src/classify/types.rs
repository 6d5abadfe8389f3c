// Classification types
// Unit labels and the explained result of classifying one unit

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminal state of a unit after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationLabel {
    /// Well isolated somatic unit
    SingleUnit,
    /// Somatic signal contaminated by other neurons
    MultiUnit,
    /// Not a neuron
    Noise,
    /// Axonal or dendritic waveform
    NonSomatic,
}

impl ClassificationLabel {
    pub const ALL: [ClassificationLabel; 4] = [
        ClassificationLabel::SingleUnit,
        ClassificationLabel::MultiUnit,
        ClassificationLabel::Noise,
        ClassificationLabel::NonSomatic,
    ];

    /// Stable snake_case name used in JSON and in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationLabel::SingleUnit => "single_unit",
            ClassificationLabel::MultiUnit => "multi_unit",
            ClassificationLabel::Noise => "noise",
            ClassificationLabel::NonSomatic => "non_somatic",
        }
    }

    /// Human-readable name for reports
    pub fn display_name(&self) -> &'static str {
        match self {
            ClassificationLabel::SingleUnit => "single unit",
            ClassificationLabel::MultiUnit => "multi-unit",
            ClassificationLabel::Noise => "noise",
            ClassificationLabel::NonSomatic => "non-somatic",
        }
    }
}

impl fmt::Display for ClassificationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ClassificationLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClassificationLabel::ALL
            .iter()
            .copied()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| format!("unknown label '{}'", s))
    }
}

/// Outcome of classifying one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: ClassificationLabel,

    /// Id of the rule that fired; `None` when the default label applied
    pub rule_id: Option<String>,

    /// Which conditions held and with what values
    pub reasoning: String,
}

/// Label of one unit, in table order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelAssignment {
    pub unit_id: u32,

    #[serde(flatten)]
    pub result: ClassificationResult,
}
