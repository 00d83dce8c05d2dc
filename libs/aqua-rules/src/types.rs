//! Alert rule type definitions
//!
//! Core types shared by the evaluator and the alarm service:
//! - AlertRule / Condition / Operator: threshold rules as stored
//! - AlertStatus: lifecycle state of an alert history record
//! - EscalationPolicy: ordered wait/notify steps
//! - Readings: one snapshot of sensor values

use crate::error::{Result, RuleError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Conditions
// ============================================================================

/// Comparison operator of a threshold condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    /// Apply `live <op> threshold`
    pub fn apply(self, live: f64, threshold: f64) -> bool {
        match self {
            Operator::Lt => live < threshold,
            Operator::Gt => live > threshold,
            Operator::Eq => (live - threshold).abs() < f64::EPSILON,
            Operator::Le => live <= threshold,
            Operator::Ge => live >= threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Eq => "=",
            Operator::Le => "<=",
            Operator::Ge => ">=",
        }
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "=" | "==" => Ok(Operator::Eq),
            "<=" => Ok(Operator::Le),
            ">=" => Ok(Operator::Ge),
            other => Err(RuleError::InvalidOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition as it is stored: loosely typed, threshold may be a string
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCondition {
    #[serde(default)]
    pub parameter: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Validated threshold condition
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Sensor parameter name as configured (matched case-insensitively)
    pub parameter: String,
    pub operator: Operator,
    pub value: f64,
}

impl Condition {
    pub fn new(parameter: impl Into<String>, operator: Operator, value: f64) -> Self {
        Self {
            parameter: parameter.into(),
            operator,
            value,
        }
    }
}

impl TryFrom<RawCondition> for Condition {
    type Error = RuleError;

    fn try_from(raw: RawCondition) -> Result<Self> {
        let parameter = raw.parameter.trim().to_string();
        if parameter.is_empty() {
            return Err(RuleError::MissingParameter);
        }
        let operator = raw.operator.parse::<Operator>()?;
        let value = match &raw.value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .ok_or_else(|| RuleError::InvalidThreshold {
            parameter: parameter.clone(),
            value: raw.value.to_string(),
        })?;

        Ok(Self {
            parameter,
            operator,
            value,
        })
    }
}

/// Parse and validate the stored JSON condition list of a rule
pub fn parse_conditions(json: &str) -> Result<Vec<Condition>> {
    let raw: Vec<RawCondition> = serde_json::from_str(json)?;
    raw.into_iter().map(Condition::try_from).collect()
}

// ============================================================================
// Rules
// ============================================================================

/// Buzzer behaviour of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuzzerMode {
    #[default]
    Once,
    Repeating,
}

impl BuzzerMode {
    /// Unknown modes fall back to `Once`
    pub fn parse_lossy(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("repeating") {
            BuzzerMode::Repeating
        } else {
            BuzzerMode::Once
        }
    }
}

/// Threshold alert rule
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    /// AND-combined; an empty list never triggers
    pub conditions: Vec<Condition>,
    pub notification_group_id: Option<i64>,
    pub escalation_policy_id: Option<i64>,
    pub enabled: bool,
    pub activate_buzzer: bool,
    pub buzzer_mode: BuzzerMode,
    pub buzzer_duration_secs: u64,
    pub snoozed_until: Option<NaiveDateTime>,
}

impl AlertRule {
    /// Minimal enabled rule without buzzer, group or policy
    pub fn new(id: i64, name: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            id,
            name: name.into(),
            conditions,
            notification_group_id: None,
            escalation_policy_id: None,
            enabled: true,
            activate_buzzer: false,
            buzzer_mode: BuzzerMode::Once,
            buzzer_duration_secs: 0,
            snoozed_until: None,
        }
    }

    pub fn with_group(mut self, group_id: i64) -> Self {
        self.notification_group_id = Some(group_id);
        self
    }

    pub fn with_policy(mut self, policy_id: i64) -> Self {
        self.escalation_policy_id = Some(policy_id);
        self
    }

    pub fn with_buzzer(mut self, mode: BuzzerMode, duration_secs: u64) -> Self {
        self.activate_buzzer = true;
        self.buzzer_mode = mode;
        self.buzzer_duration_secs = duration_secs;
        self
    }

    /// Whether the rule takes part in evaluation at `now`
    pub fn is_alertable(&self, now: NaiveDateTime) -> bool {
        self.enabled && self.snoozed_until.map_or(true, |until| until < now)
    }

    /// Severity key for buzzer arbitration: buzzer enabled, then repeating,
    /// then longest duration
    pub fn buzzer_severity(&self) -> (bool, bool, u64) {
        (
            self.activate_buzzer,
            self.buzzer_mode == BuzzerMode::Repeating,
            self.buzzer_duration_secs,
        )
    }
}

// ============================================================================
// Alert history status
// ============================================================================

/// Status of an alert history record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertStatus {
    Triggered,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Triggered => "Triggered",
            AlertStatus::Acknowledged => "Acknowledged",
            AlertStatus::Resolved => "Resolved",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Triggered" => Ok(AlertStatus::Triggered),
            "Acknowledged" => Ok(AlertStatus::Acknowledged),
            "Resolved" => Ok(AlertStatus::Resolved),
            other => Err(RuleError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Escalation policies
// ============================================================================

/// Accepts `10`, `"10"`, `null` and `""`
fn deserialize_lenient_i64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Float(f64),
        Str(String),
        Null,
    }

    Ok(match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Some(v),
        IntOrString::Float(v) => Some(v as i64),
        IntOrString::Str(s) => s.trim().parse::<i64>().ok(),
        IntOrString::Null => None,
    })
}

/// One wait/notify step of an escalation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStep {
    #[serde(default, deserialize_with = "deserialize_lenient_i64")]
    pub wait_minutes: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_lenient_i64")]
    pub group_id: Option<i64>,
}

impl EscalationStep {
    pub fn new(wait_minutes: i64, group_id: i64) -> Self {
        Self {
            wait_minutes: Some(wait_minutes),
            group_id: Some(group_id),
        }
    }

    /// Wait and target of a step that should run; `None` means skip it
    pub fn actionable(&self) -> Option<(u64, i64)> {
        let wait = self.wait_minutes.filter(|w| *w > 0)?;
        let group = self.group_id?;
        Some((wait as u64, group))
    }
}

/// Ordered escalation workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: i64,
    pub name: String,
    pub path: Vec<EscalationStep>,
}

impl EscalationPolicy {
    /// Build a policy from its stored JSON step list
    pub fn from_json_path(id: i64, name: impl Into<String>, path: &str) -> Result<Self> {
        Ok(Self {
            id,
            name: name.into(),
            path: serde_json::from_str(path)?,
        })
    }
}

// ============================================================================
// Readings
// ============================================================================

/// Snapshot of sensor values keyed by lower-cased parameter name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings(HashMap<String, f64>);

impl Readings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parameter: &str, value: f64) {
        self.0.insert(parameter.to_lowercase(), value);
    }

    pub fn with(mut self, parameter: &str, value: f64) -> Self {
        self.insert(parameter, value);
        self
    }

    /// Case-insensitive lookup
    pub fn get(&self, parameter: &str) -> Option<f64> {
        self.0.get(&parameter.to_lowercase()).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: AsRef<str>> FromIterator<(K, f64)> for Readings {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut readings = Readings::new();
        for (k, v) in iter {
            readings.insert(k.as_ref(), v);
        }
        readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_parse() {
        assert_eq!("<".parse::<Operator>().unwrap(), Operator::Lt);
        assert_eq!(">=".parse::<Operator>().unwrap(), Operator::Ge);
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Eq);
        assert!("!=".parse::<Operator>().is_err());
    }

    #[test]
    fn test_condition_accepts_string_threshold() {
        let raw = RawCondition {
            parameter: "pH".to_string(),
            operator: "<".to_string(),
            value: json!("4.0"),
        };
        let cond = Condition::try_from(raw).unwrap();
        assert_eq!(cond, Condition::new("pH", Operator::Lt, 4.0));
    }

    #[test]
    fn test_condition_rejects_bad_threshold() {
        let raw = RawCondition {
            parameter: "tds".to_string(),
            operator: ">".to_string(),
            value: json!("high"),
        };
        assert!(matches!(
            Condition::try_from(raw),
            Err(RuleError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_parse_conditions() {
        let conds =
            parse_conditions(r#"[{"parameter":"ph","operator":"<","value":4},{"parameter":"tds","operator":">","value":"500"}]"#)
                .unwrap();
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[1].value, 500.0);

        assert!(parse_conditions(r#"[{"parameter":"ph","operator":"~","value":4}]"#).is_err());
    }

    #[test]
    fn test_readings_case_insensitive() {
        let readings = Readings::new().with("pH", 7.1);
        assert_eq!(readings.get("ph"), Some(7.1));
        assert_eq!(readings.get("PH"), Some(7.1));
        assert_eq!(readings.get("tds"), None);
    }

    #[test]
    fn test_escalation_path_lenient() {
        let policy = EscalationPolicy::from_json_path(
            1,
            "Night shift",
            r#"[{"wait_minutes":"10","group_id":2},{"wait_minutes":0,"group_id":3},{"wait_minutes":5,"group_id":null}]"#,
        )
        .unwrap();
        assert_eq!(policy.path[0].actionable(), Some((10, 2)));
        assert_eq!(policy.path[1].actionable(), None);
        assert_eq!(policy.path[2].actionable(), None);
    }

    #[test]
    fn test_alertable_respects_snooze() {
        let now = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut rule = AlertRule::new(1, "Low pH", vec![]);
        assert!(rule.is_alertable(now));

        rule.snoozed_until = Some(now + chrono::Duration::minutes(5));
        assert!(!rule.is_alertable(now));

        rule.snoozed_until = Some(now - chrono::Duration::minutes(5));
        assert!(rule.is_alertable(now));

        rule.enabled = false;
        assert!(!rule.is_alertable(now));
    }
}
