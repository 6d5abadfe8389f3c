// Classification decision engine
// First-match evaluation of ordered threshold rules over a unit's metrics record

use crate::classify::config::{Combine, Condition, Rule, RuleSet, UndefinedPolicy};
use crate::classify::types::{ClassificationLabel, ClassificationResult, LabelAssignment};
use crate::metrics::{MetricValue, QualityMetricsRecord};

/// Label given when no rule fires
pub const DEFAULT_LABEL: ClassificationLabel = ClassificationLabel::SingleUnit;

/// Whether one condition holds, with a description of why
fn evaluate(condition: &Condition, value: &MetricValue) -> (bool, String) {
    let name = condition.metric.as_str();
    match value {
        MetricValue::Defined { value } => {
            let holds = condition.op.holds(*value, condition.cutoff);
            let symbol = if holds {
                condition.op.symbol().to_string()
            } else {
                format!("not {}", condition.op.symbol())
            };
            (holds, format!("{} = {:.4} {} {}", name, value, symbol, condition.cutoff))
        }
        MetricValue::Undefined { reason } => match condition.on_undefined {
            UndefinedPolicy::Violates => (true, format!("{} undefined ({}), counted as violating", name, reason)),
            UndefinedPolicy::Passes => (false, format!("{} undefined ({}), counted as passing", name, reason)),
        },
        MetricValue::NotApplicable => (false, format!("{} not applicable", name)),
    }
}

/// Evaluate a rule; returns the reasoning when it fires
fn fires(rule: &Rule, record: &QualityMetricsRecord) -> Option<String> {
    let outcomes: Vec<(bool, String)> = rule
        .conditions
        .iter()
        .map(|c| evaluate(c, record.get(c.metric)))
        .collect();

    let fired = match rule.combine {
        Combine::All => outcomes.iter().all(|(holds, _)| *holds),
        Combine::Any => outcomes.iter().any(|(holds, _)| *holds),
    };
    if !fired {
        return None;
    }

    let joiner = match rule.combine {
        Combine::All => " and ",
        Combine::Any => " or ",
    };
    let held: Vec<String> = outcomes
        .into_iter()
        .filter(|(holds, _)| *holds)
        .map(|(_, why)| why)
        .collect();
    Some(held.join(joiner))
}

/// Classify one unit. Pure: the same record and rules always give the same result.
pub fn classify(record: &QualityMetricsRecord, rules: &RuleSet) -> ClassificationResult {
    for rule in rules.rules() {
        if let Some(why) = fires(rule, record) {
            return ClassificationResult {
                label: rule.label,
                rule_id: Some(rule.id.clone()),
                reasoning: format!(
                    "Classified as {} by rule '{}' (priority {}): {}.",
                    rule.label.display_name(),
                    rule.id,
                    rule.priority,
                    why
                ),
            };
        }
    }

    ClassificationResult {
        label: DEFAULT_LABEL,
        rule_id: None,
        reasoning: format!(
            "No rule fired ({} checked); classified as {}.",
            rules.len(),
            DEFAULT_LABEL.display_name()
        ),
    }
}

/// Classify every record, keeping table order
pub fn classify_all(records: &[QualityMetricsRecord], rules: &RuleSet) -> Vec<LabelAssignment> {
    let assignments: Vec<LabelAssignment> = records
        .iter()
        .map(|record| LabelAssignment {
            unit_id: record.unit_id,
            result: classify(record, rules),
        })
        .collect();

    for label in ClassificationLabel::ALL {
        let count = assignments.iter().filter(|a| a.result.label == label).count();
        log::debug!("{}: {} unit(s)", label.display_name(), count);
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::config::{Comparison, MetricCondition, ThresholdConfig, ThresholdRule};
    use crate::metrics::{MetricFailure, MetricName, RecordBuilder};

    fn condition(metric: &str, op: Comparison, cutoff: f64) -> MetricCondition {
        MetricCondition {
            metric: metric.to_string(),
            op,
            cutoff,
            on_undefined: UndefinedPolicy::Violates,
        }
    }

    fn rule(id: &str, label: ClassificationLabel, priority: u32, conditions: Vec<MetricCondition>) -> ThresholdRule {
        ThresholdRule {
            id: id.to_string(),
            label,
            priority,
            combine: Combine::All,
            conditions,
        }
    }

    fn noisy_contaminated_record() -> QualityMetricsRecord {
        RecordBuilder::new(3, 0)
            .set(MetricName::PresenceRatio, MetricValue::defined(0.4))
            .set(MetricName::FractionRpv, MetricValue::defined(0.3))
            .build()
    }

    #[test]
    fn test_no_rules_defaults_to_single_unit() {
        let result = classify(&noisy_contaminated_record(), &RuleSet::default());
        assert_eq!(result.label, ClassificationLabel::SingleUnit);
        assert!(result.rule_id.is_none());
    }

    #[test]
    fn test_rule_order_decides_between_violated_rules() {
        let noise = rule(
            "noise_presence",
            ClassificationLabel::Noise,
            1,
            vec![condition("presence_ratio", Comparison::Lt, 0.7)],
        );
        let mua = rule(
            "mua_rpv",
            ClassificationLabel::MultiUnit,
            2,
            vec![condition("fraction_rpv", Comparison::Gt, 0.1)],
        );

        let noise_first = ThresholdConfig {
            rules: vec![noise.clone(), mua.clone()],
        };
        let mut swapped = noise_first.clone();
        swapped.rules[0].priority = 2;
        swapped.rules[1].priority = 1;

        let record = noisy_contaminated_record();
        let a = classify(&record, &noise_first.validate().unwrap());
        let b = classify(&record, &swapped.validate().unwrap());

        assert_eq!(a.label, ClassificationLabel::Noise);
        assert_eq!(a.rule_id.as_deref(), Some("noise_presence"));
        assert_eq!(b.label, ClassificationLabel::MultiUnit);
        assert_eq!(b.rule_id.as_deref(), Some("mua_rpv"));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let config = ThresholdConfig {
            rules: vec![rule(
                "mua_rpv",
                ClassificationLabel::MultiUnit,
                1,
                vec![condition("fraction_rpv", Comparison::Gt, 0.1)],
            )],
        };
        let rules = config.validate().unwrap();
        let record = noisy_contaminated_record();
        let first = classify(&record, &rules);
        for _ in 0..10 {
            assert_eq!(classify(&record, &rules), first);
        }
    }

    #[test]
    fn test_all_and_any() {
        let mut config = ThresholdConfig {
            rules: vec![rule(
                "both",
                ClassificationLabel::Noise,
                1,
                vec![
                    condition("presence_ratio", Comparison::Lt, 0.7),
                    condition("fraction_rpv", Comparison::Gt, 0.5),
                ],
            )],
        };
        let record = noisy_contaminated_record();
        assert_eq!(
            classify(&record, &config.validate().unwrap()).label,
            ClassificationLabel::SingleUnit
        );

        config.rules[0].combine = Combine::Any;
        let result = classify(&record, &config.validate().unwrap());
        assert_eq!(result.label, ClassificationLabel::Noise);
        assert!(result.reasoning.contains("presence_ratio = 0.4000 < 0.7"));
        assert!(!result.reasoning.contains("fraction_rpv"));
    }

    #[test]
    fn test_undefined_policy() {
        let record = RecordBuilder::new(1, 0)
            .set(
                MetricName::PercentMissing,
                MetricValue::undefined(MetricFailure::insufficient("spikes", 6, 3)),
            )
            .build();
        let mut config = ThresholdConfig {
            rules: vec![rule(
                "mua_missing",
                ClassificationLabel::MultiUnit,
                1,
                vec![condition("percent_missing", Comparison::Gt, 20.0)],
            )],
        };

        let violates = classify(&record, &config.validate().unwrap());
        assert_eq!(violates.label, ClassificationLabel::MultiUnit);
        assert!(violates.reasoning.contains("percent_missing undefined"));

        config.rules[0].conditions[0].on_undefined = UndefinedPolicy::Passes;
        let passes = classify(&record, &config.validate().unwrap());
        assert_eq!(passes.label, ClassificationLabel::SingleUnit);
    }

    #[test]
    fn test_not_applicable_never_fires() {
        // Drift was disabled for this run
        let record = RecordBuilder::new(1, 0).build();
        for op in [Comparison::Lt, Comparison::Ge, Comparison::Ne] {
            let config = ThresholdConfig {
                rules: vec![rule(
                    "drift",
                    ClassificationLabel::Noise,
                    1,
                    vec![condition("max_drift", op, 50.0)],
                )],
            };
            let result = classify(&record, &config.validate().unwrap());
            assert_eq!(result.label, ClassificationLabel::SingleUnit);
        }
    }

    #[test]
    fn test_boundary_comparisons() {
        let record = RecordBuilder::new(1, 0)
            .set(MetricName::NPeaks, MetricValue::from_count(2))
            .build();
        let check = |op: Comparison| {
            let config = ThresholdConfig {
                rules: vec![rule("r", ClassificationLabel::Noise, 1, vec![condition("n_peaks", op, 2.0)])],
            };
            classify(&record, &config.validate().unwrap()).label == ClassificationLabel::Noise
        };
        assert!(!check(Comparison::Lt));
        assert!(check(Comparison::Le));
        assert!(!check(Comparison::Gt));
        assert!(check(Comparison::Ge));
        assert!(check(Comparison::Eq));
        assert!(!check(Comparison::Ne));
    }

    #[test]
    fn test_classify_all_keeps_order() {
        let records: Vec<QualityMetricsRecord> = [9, 2, 5]
            .iter()
            .map(|&id| {
                RecordBuilder::new(id, 0)
                    .set(MetricName::PresenceRatio, MetricValue::defined(id as f64 / 10.0))
                    .build()
            })
            .collect();
        let config = ThresholdConfig {
            rules: vec![rule(
                "noise",
                ClassificationLabel::Noise,
                1,
                vec![condition("presence_ratio", Comparison::Lt, 0.7)],
            )],
        };
        let labels = classify_all(&records, &config.validate().unwrap());
        let ids: Vec<u32> = labels.iter().map(|l| l.unit_id).collect();
        assert_eq!(ids, vec![9, 2, 5]);
        assert_eq!(labels[0].result.label, ClassificationLabel::SingleUnit);
        assert_eq!(labels[1].result.label, ClassificationLabel::Noise);
        assert_eq!(labels[2].result.label, ClassificationLabel::Noise);
    }
}
