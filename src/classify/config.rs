// Threshold configuration
// Externally supplied classification rules, validated into an ordered rule set before any unit is processed

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::classify::types::ClassificationLabel;
use crate::metrics::MetricName;

/// Invalid threshold rules or extraction parameters. Fatal, raised before any per-unit work.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid parameter {name}: {detail}")]
    InvalidParameter { name: String, detail: String },

    #[error("Rule '{rule}' references unknown metric '{metric}'")]
    UnknownMetric { rule: String, metric: String },

    #[error("Rules '{first}' and '{second}' share priority {priority}")]
    DuplicatePriority {
        priority: u32,
        first: String,
        second: String,
    },

    #[error("Rule id '{0}' is used more than once")]
    DuplicateRuleId(String),

    #[error("Rule '{0}' has no conditions")]
    EmptyRule(String),

    #[error("Rule '{rule}' has a non-finite cutoff for '{metric}'")]
    NonFiniteCutoff { rule: String, metric: String },
}

/// Comparison between a metric value and a cutoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparison {
    pub fn holds(&self, value: f64, cutoff: f64) -> bool {
        match self {
            Comparison::Lt => value < cutoff,
            Comparison::Le => value <= cutoff,
            Comparison::Gt => value > cutoff,
            Comparison::Ge => value >= cutoff,
            Comparison::Eq => value == cutoff,
            Comparison::Ne => value != cutoff,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// How a condition treats an undefined metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedPolicy {
    /// The condition holds, as if the cutoff were crossed
    #[default]
    Violates,
    /// The condition does not hold
    Passes,
}

/// How a rule combines its conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    #[default]
    All,
    Any,
}

/// `metric op cutoff`, e.g. `presence_ratio < 0.7`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCondition {
    pub metric: String,
    pub op: Comparison,
    pub cutoff: f64,

    #[serde(default)]
    pub on_undefined: UndefinedPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub id: String,
    pub label: ClassificationLabel,

    /// Lower values are evaluated first
    pub priority: u32,

    #[serde(default)]
    pub combine: Combine,

    pub conditions: Vec<MetricCondition>,
}

/// Classification rules as supplied by the user
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub rules: Vec<ThresholdRule>,
}

/// A condition with its metric name resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub metric: MetricName,
    pub op: Comparison,
    pub cutoff: f64,
    pub on_undefined: UndefinedPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub label: ClassificationLabel,
    pub priority: u32,
    pub combine: Combine,
    pub conditions: Vec<Condition>,
}

/// Validated rules in evaluation order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every metric some rule reads, without repeats
    pub fn referenced_metrics(&self) -> Vec<MetricName> {
        let mut names: Vec<MetricName> = self
            .rules
            .iter()
            .flat_map(|r| r.conditions.iter().map(|c| c.metric))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl ThresholdConfig {
    /// Load rules from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(json: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check every rule and order them by priority
    pub fn validate(&self) -> Result<RuleSet, ConfigurationError> {
        let mut ids: HashSet<&str> = HashSet::new();
        let mut priorities: HashMap<u32, &str> = HashMap::new();
        let mut rules = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            if !ids.insert(rule.id.as_str()) {
                return Err(ConfigurationError::DuplicateRuleId(rule.id.clone()));
            }
            if let Some(first) = priorities.insert(rule.priority, rule.id.as_str()) {
                return Err(ConfigurationError::DuplicatePriority {
                    priority: rule.priority,
                    first: first.to_string(),
                    second: rule.id.clone(),
                });
            }
            if rule.conditions.is_empty() {
                return Err(ConfigurationError::EmptyRule(rule.id.clone()));
            }

            let mut conditions = Vec::with_capacity(rule.conditions.len());
            for c in &rule.conditions {
                let metric: MetricName =
                    c.metric.parse().map_err(|_| ConfigurationError::UnknownMetric {
                        rule: rule.id.clone(),
                        metric: c.metric.clone(),
                    })?;
                if !c.cutoff.is_finite() {
                    return Err(ConfigurationError::NonFiniteCutoff {
                        rule: rule.id.clone(),
                        metric: c.metric.clone(),
                    });
                }
                conditions.push(Condition {
                    metric,
                    op: c.op,
                    cutoff: c.cutoff,
                    on_undefined: c.on_undefined,
                });
            }

            rules.push(Rule {
                id: rule.id.clone(),
                label: rule.label,
                priority: rule.priority,
                combine: rule.combine,
                conditions,
            });
        }

        rules.sort_by_key(|r| r.priority);
        log::debug!("Validated {} classification rule(s)", rules.len());
        Ok(RuleSet { rules })
    }
}
