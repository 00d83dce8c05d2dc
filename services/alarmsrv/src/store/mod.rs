//! Persistent alert state
//!
//! The `AlertStore` trait covers everything the alarm engine reads or writes:
//! alert rules, alert history, escalation policies, group phone numbers,
//! device info and the latest sensor measurement.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use aqua_rules::{AlertRule, AlertStatus, EscalationPolicy, Readings};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Timestamp format used for every stored time (local time)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time, truncated to whole seconds
pub fn local_now() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

pub(crate) fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()
}

/// Numbers shorter than 11 characters are placeholders, not real numbers
pub fn is_valid_phone_number(number: &str) -> bool {
    number.trim().len() > 10
}

/// One row of the alert history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertHistoryRecord {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub rule_id: i64,
    pub details: String,
    pub status: AlertStatus,
    pub acknowledged_by: Option<i64>,
    pub acknowledged_at: Option<NaiveDateTime>,
}

/// One row of the `measurements` table
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub id: i64,
    pub readings: Readings,
}

/// Device metadata used in SMS bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    /// Free text or a JSON object with coordinates/municipality/province
    pub location: Option<String>,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Enabled rules that are not snoozed at `now`
    async fn active_rules(&self, now: NaiveDateTime) -> Result<Vec<AlertRule>>;

    /// Create a `Triggered` history record and return its id
    async fn open_alert(&self, rule_id: i64, details: &str) -> Result<i64>;

    /// Move a `Triggered` or `Acknowledged` record to `Resolved`
    async fn resolve_alert(&self, history_id: i64) -> Result<()>;

    /// Current status, read fresh on every call
    async fn alert_status(&self, history_id: i64) -> Result<Option<AlertStatus>>;

    async fn history_record(&self, history_id: i64) -> Result<Option<AlertHistoryRecord>>;

    /// Human acknowledgement; only a `Triggered` record changes.
    /// Returns whether the record was updated.
    async fn acknowledge_alert(&self, history_id: i64, user_id: i64) -> Result<bool>;

    /// Exclude a rule from evaluation for `minutes`. Returns false for an unknown rule.
    async fn snooze_rule(&self, rule_id: i64, minutes: i64) -> Result<bool>;

    async fn escalation_policy(&self, policy_id: i64) -> Result<Option<EscalationPolicy>>;

    /// Valid phone numbers of the group's members
    async fn group_phone_numbers(&self, group_id: i64) -> Result<Vec<String>>;

    async fn device_info(&self, device_id: &str) -> Result<Option<DeviceInfo>>;

    /// Most recent sensor measurement, if any
    async fn latest_measurement(&self) -> Result<Option<Measurement>>;
}
