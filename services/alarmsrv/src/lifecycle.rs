//! Alert lifecycle
//!
//! `AlertLifecycleManager::evaluate_cycle` is called once per sensor reading.
//! It diffs the rules triggered now against the alerts it currently tracks:
//! newly triggered rules open a history record, notify and (with a policy)
//! start escalation; rules that stopped triggering are resolved. The buzzer
//! is reconciled last. Notification and escalation work runs in background
//! tasks, so a cycle only waits on the store.
//!
//! A failed store write is logged and the rule is left as it was, so the same
//! transition is attempted again on the next cycle.
//!
//! A rule that clears and triggers again within the throttle window of its
//! last notification is not reopened until the window has passed.

use crate::buzzer::LocalAlarmController;
use crate::dispatcher::{NotificationDispatcher, SmsTask};
use crate::error::Result;
use crate::escalation::EscalationScheduler;
use crate::events::{AlertEvent, EventBus, NewAlert};
use crate::store::{local_now, AlertStore};
use aqua_rules::{condition_summary, evaluate, trigger_details, AlertRule, Readings};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Default)]
struct LifecycleState {
    /// rule id -> open history record id
    active: HashMap<i64, i64>,
    /// rule id -> when its initial notification was queued; kept across
    /// resolution and pruned once older than the throttle window
    last_notified: HashMap<i64, Instant>,
}

/// What one evaluation cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Rules whose conditions hold now
    pub triggered: Vec<i64>,
    /// History ids opened this cycle
    pub opened: Vec<i64>,
    /// History ids resolved this cycle
    pub resolved: Vec<i64>,
}

pub struct AlertLifecycleManager {
    store: Arc<dyn AlertStore>,
    dispatcher: Arc<NotificationDispatcher>,
    escalation: Arc<EscalationScheduler>,
    buzzer: Option<Arc<LocalAlarmController>>,
    events: EventBus,
    throttle: Duration,
    state: Mutex<LifecycleState>,
}

impl AlertLifecycleManager {
    pub fn new(
        store: Arc<dyn AlertStore>,
        dispatcher: Arc<NotificationDispatcher>,
        escalation: Arc<EscalationScheduler>,
        events: EventBus,
        throttle: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            escalation,
            buzzer: None,
            events,
            throttle,
            state: Mutex::new(LifecycleState::default()),
        }
    }

    pub fn with_buzzer(mut self, buzzer: Arc<LocalAlarmController>) -> Self {
        self.buzzer = Some(buzzer);
        self
    }

    /// Rule id -> history id of every alert currently tracked as open
    pub async fn active_alerts(&self) -> HashMap<i64, i64> {
        self.state.lock().await.active.clone()
    }

    /// Run one evaluation cycle against `readings`
    ///
    /// Fails only when the rule set cannot be loaded; per-rule store failures
    /// are logged and retried on the next cycle.
    pub async fn evaluate_cycle(&self, readings: &Readings) -> Result<CycleOutcome> {
        let rules = self.store.active_rules(local_now()).await?;
        let triggered: Vec<&AlertRule> = rules.iter().filter(|r| evaluate(r, readings)).collect();
        let triggered_ids: HashSet<i64> = triggered.iter().map(|r| r.id).collect();

        let mut state = self.state.lock().await;
        let throttle = self.throttle;
        state.last_notified.retain(|_, at| at.elapsed() <= throttle);

        let mut outcome = CycleOutcome {
            triggered: triggered.iter().map(|r| r.id).collect(),
            ..CycleOutcome::default()
        };
        let mut newly_opened = HashSet::new();

        for rule in &triggered {
            if state.active.contains_key(&rule.id) {
                continue;
            }
            if let Some(history_id) = self.open_alert(&mut state, rule, readings).await {
                newly_opened.insert(rule.id);
                outcome.opened.push(history_id);
            }
        }

        let mut cleared: Vec<(i64, i64)> = state
            .active
            .iter()
            .filter(|(rule_id, _)| !triggered_ids.contains(rule_id))
            .map(|(rule_id, history_id)| (*rule_id, *history_id))
            .collect();
        cleared.sort_unstable();

        for (rule_id, history_id) in cleared {
            if self.resolve_alert(&mut state, rule_id, history_id).await {
                outcome.resolved.push(history_id);
            }
        }

        if let Some(buzzer) = &self.buzzer {
            buzzer.reconcile(&triggered, &newly_opened);
        }

        if !outcome.opened.is_empty() || !outcome.resolved.is_empty() {
            debug!(
                opened = outcome.opened.len(),
                resolved = outcome.resolved.len(),
                active = state.active.len(),
                "Evaluation cycle changed alert state"
            );
        }
        Ok(outcome)
    }

    async fn open_alert(
        &self,
        state: &mut LifecycleState,
        rule: &AlertRule,
        readings: &Readings,
    ) -> Option<i64> {
        let now = Instant::now();
        if let Some(last) = state.last_notified.get(&rule.id) {
            if now.duration_since(*last) <= self.throttle {
                debug!(rule_id = rule.id, "Rule notified recently, throttled");
                return None;
            }
        }

        let details = trigger_details(rule, readings);
        let history_id = match self.store.open_alert(rule.id, &details).await {
            Ok(id) => id,
            Err(e) => {
                error!(rule_id = rule.id, "Failed to log alert for '{}': {}", rule.name, e);
                return None;
            },
        };
        info!(rule_id = rule.id, history_id, "Rule '{}' triggered: {}", rule.name, details);
        state.active.insert(rule.id, history_id);

        self.events.emit(AlertEvent::NewAlert(NewAlert {
            history_id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            details: format!("Condition met: {}", condition_summary(&rule.conditions)),
        }));

        self.dispatcher.enqueue(SmsTask::initial(
            rule.name.clone(),
            rule.notification_group_id,
            readings.clone(),
        ));
        state.last_notified.insert(rule.id, now);

        if let Some(policy_id) = rule.escalation_policy_id {
            self.escalation
                .start(history_id, policy_id, &rule.name, readings.clone());
        }
        Some(history_id)
    }

    async fn resolve_alert(&self, state: &mut LifecycleState, rule_id: i64, history_id: i64) -> bool {
        if let Err(e) = self.store.resolve_alert(history_id).await {
            error!(rule_id, history_id, "Failed to resolve alert: {}", e);
            return false;
        }
        info!(rule_id, history_id, "Rule cleared, alert resolved");

        state.active.remove(&rule_id);
        self.events.emit(AlertEvent::AlertCleared);
        self.escalation.forget(history_id);
        true
    }
}
