//! Rule evaluation against a reading snapshot
//!
//! Evaluation is fail-closed: a missing reading or an empty condition list
//! means "not triggered". Thresholds are validated when rules are loaded, so
//! nothing here can fail.

use crate::types::{AlertRule, Condition, Readings};

/// Evaluate a single condition; `false` when the parameter has no reading
pub fn evaluate_condition(condition: &Condition, readings: &Readings) -> bool {
    match readings.get(&condition.parameter) {
        Some(live) => condition.operator.apply(live, condition.value),
        None => false,
    }
}

/// Whether every condition of `rule` holds for `readings`
pub fn evaluate(rule: &AlertRule, readings: &Readings) -> bool {
    !rule.conditions.is_empty()
        && rule
            .conditions
            .iter()
            .all(|cond| evaluate_condition(cond, readings))
}

/// History details for a newly triggered rule, e.g. `pH was 3.20`
///
/// One entry per condition whose parameter has a reading, joined by `", "`.
pub fn trigger_details(rule: &AlertRule, readings: &Readings) -> String {
    rule.conditions
        .iter()
        .filter_map(|cond| {
            readings
                .get(&cond.parameter)
                .map(|live| format!("{} was {:.2}", cond.parameter, live))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_threshold(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// Human readable condition list, e.g. `pH < 4.0, tds > 500.0`
pub fn condition_summary(conditions: &[Condition]) -> String {
    if conditions.is_empty() {
        return "N/A".to_string();
    }
    conditions
        .iter()
        .map(|c| format!("{} {} {}", c.parameter, c.operator, format_threshold(c.value)))
        .collect::<Vec<_>>()
        .join(", ")
}
