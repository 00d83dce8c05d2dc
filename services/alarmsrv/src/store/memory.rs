//! In-memory alert store
//!
//! Same semantics as the SQLite store, plus seeding helpers and switches that
//! make individual operations fail.

use super::{
    is_valid_phone_number, local_now, AlertHistoryRecord, AlertStore, DeviceInfo, Measurement,
};
use crate::error::{AlarmError, Result};
use aqua_rules::{AlertRule, AlertStatus, EscalationPolicy, Readings};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct MemoryState {
    rules: BTreeMap<i64, AlertRule>,
    history: BTreeMap<i64, AlertHistoryRecord>,
    next_history_id: i64,
    policies: HashMap<i64, EscalationPolicy>,
    groups: HashMap<i64, Vec<String>>,
    devices: HashMap<String, DeviceInfo>,
    measurement: Option<Measurement>,
    resolve_calls: usize,
    fail_rules: bool,
    fail_writes: bool,
    fail_status: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

fn injected(op: &str) -> AlarmError {
    AlarmError::Database(format!("{} unavailable", op))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.state.lock().rules.insert(rule.id, rule);
    }

    pub fn add_policy(&self, policy: EscalationPolicy) {
        self.state.lock().policies.insert(policy.id, policy);
    }

    /// Register a group with its members' phone numbers (unfiltered)
    pub fn add_group(&self, group_id: i64, numbers: &[&str]) {
        self.state
            .lock()
            .groups
            .insert(group_id, numbers.iter().map(|n| n.to_string()).collect());
    }

    pub fn add_device(&self, device: DeviceInfo) {
        self.state.lock().devices.insert(device.id.clone(), device);
    }

    /// Record a new measurement row with the next id
    pub fn set_readings(&self, readings: Readings) {
        let mut state = self.state.lock();
        let id = state.measurement.as_ref().map_or(1, |m| m.id + 1);
        state.measurement = Some(Measurement { id, readings });
    }

    /// Overwrite a record's status, bypassing transition rules
    pub fn set_status(&self, history_id: i64, status: AlertStatus) {
        if let Some(record) = self.state.lock().history.get_mut(&history_id) {
            record.status = status;
        }
    }

    /// Make `active_rules` fail
    pub fn fail_rule_fetch(&self, fail: bool) {
        self.state.lock().fail_rules = fail;
    }

    /// Make `open_alert` and `resolve_alert` fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make `alert_status` fail
    pub fn fail_status_reads(&self, fail: bool) {
        self.state.lock().fail_status = fail;
    }

    /// Number of successful `resolve_alert` calls
    pub fn resolve_calls(&self) -> usize {
        self.state.lock().resolve_calls
    }

    /// All history records, oldest first
    pub fn history(&self) -> Vec<AlertHistoryRecord> {
        self.state.lock().history.values().cloned().collect()
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn active_rules(&self, now: NaiveDateTime) -> Result<Vec<AlertRule>> {
        let state = self.state.lock();
        if state.fail_rules {
            return Err(injected("alert_rules"));
        }
        Ok(state
            .rules
            .values()
            .filter(|r| r.is_alertable(now))
            .cloned()
            .collect())
    }

    async fn open_alert(&self, rule_id: i64, details: &str) -> Result<i64> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(injected("alert_history"));
        }
        state.next_history_id += 1;
        let id = state.next_history_id;
        state.history.insert(
            id,
            AlertHistoryRecord {
                id,
                timestamp: local_now(),
                rule_id,
                details: details.to_string(),
                status: AlertStatus::Triggered,
                acknowledged_by: None,
                acknowledged_at: None,
            },
        );
        Ok(id)
    }

    async fn resolve_alert(&self, history_id: i64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(injected("alert_history"));
        }
        state.resolve_calls += 1;
        if let Some(record) = state.history.get_mut(&history_id) {
            if matches!(
                record.status,
                AlertStatus::Triggered | AlertStatus::Acknowledged
            ) {
                record.status = AlertStatus::Resolved;
            }
        }
        Ok(())
    }

    async fn alert_status(&self, history_id: i64) -> Result<Option<AlertStatus>> {
        let state = self.state.lock();
        if state.fail_status {
            return Err(injected("alert_history"));
        }
        Ok(state.history.get(&history_id).map(|r| r.status))
    }

    async fn history_record(&self, history_id: i64) -> Result<Option<AlertHistoryRecord>> {
        Ok(self.state.lock().history.get(&history_id).cloned())
    }

    async fn acknowledge_alert(&self, history_id: i64, user_id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.history.get_mut(&history_id) {
            Some(record) if record.status == AlertStatus::Triggered => {
                record.status = AlertStatus::Acknowledged;
                record.acknowledged_by = Some(user_id);
                record.acknowledged_at = Some(local_now());
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn snooze_rule(&self, rule_id: i64, minutes: i64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.rules.get_mut(&rule_id) {
            Some(rule) => {
                rule.snoozed_until = Some(local_now() + chrono::Duration::minutes(minutes));
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn escalation_policy(&self, policy_id: i64) -> Result<Option<EscalationPolicy>> {
        Ok(self.state.lock().policies.get(&policy_id).cloned())
    }

    async fn group_phone_numbers(&self, group_id: i64) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .groups
            .get(&group_id)
            .map(|numbers| {
                numbers
                    .iter()
                    .filter(|n| is_valid_phone_number(n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn device_info(&self, device_id: &str) -> Result<Option<DeviceInfo>> {
        Ok(self.state.lock().devices.get(device_id).cloned())
    }

    async fn latest_measurement(&self) -> Result<Option<Measurement>> {
        Ok(self.state.lock().measurement.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_rules::{Condition, Operator};

    #[tokio::test]
    async fn test_status_transitions() {
        let store = MemoryStore::new();
        let id = store.open_alert(1, "pH was 3.20").await.unwrap();
        assert_eq!(
            store.alert_status(id).await.unwrap(),
            Some(AlertStatus::Triggered)
        );

        assert!(store.acknowledge_alert(id, 7).await.unwrap());
        assert!(!store.acknowledge_alert(id, 8).await.unwrap());

        store.resolve_alert(id).await.unwrap();
        let record = store.history_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, AlertStatus::Resolved);
        assert_eq!(record.acknowledged_by, Some(7));

        // resolved records are left untouched
        store.resolve_alert(id).await.unwrap();
        assert!(!store.acknowledge_alert(id, 9).await.unwrap());
        assert_eq!(
            store.alert_status(id).await.unwrap(),
            Some(AlertStatus::Resolved)
        );
    }

    #[tokio::test]
    async fn test_snoozed_rules_hidden() {
        let store = MemoryStore::new();
        store.add_rule(AlertRule::new(
            1,
            "Low pH",
            vec![Condition::new("ph", Operator::Lt, 4.0)],
        ));
        assert_eq!(store.active_rules(local_now()).await.unwrap().len(), 1);

        assert!(store.snooze_rule(1, 30).await.unwrap());
        assert!(store.active_rules(local_now()).await.unwrap().is_empty());
        assert!(!store.snooze_rule(99, 30).await.unwrap());
    }

    #[tokio::test]
    async fn test_short_numbers_filtered() {
        let store = MemoryStore::new();
        store.add_group(1, &["+639171234567", "12345", "", "09171234567"]);
        assert_eq!(
            store.group_phone_numbers(1).await.unwrap(),
            vec!["+639171234567".to_string(), "09171234567".to_string()]
        );
        assert!(store.group_phone_numbers(2).await.unwrap().is_empty());
    }
}
