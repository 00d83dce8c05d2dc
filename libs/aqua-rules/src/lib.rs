//! AquaWatch alert rules
//!
//! Data model for threshold alert rules, escalation policies and reading
//! snapshots, plus the pure rule evaluator used by the alarm service.

pub mod error;
pub mod evaluator;
pub mod types;

pub use error::{Result, RuleError};
pub use evaluator::{condition_summary, evaluate, trigger_details};
pub use types::{
    parse_conditions, AlertRule, AlertStatus, BuzzerMode, Condition, EscalationPolicy,
    EscalationStep, Operator, RawCondition, Readings,
};
