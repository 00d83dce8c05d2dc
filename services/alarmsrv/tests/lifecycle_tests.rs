//! Alert lifecycle integration tests

#![allow(clippy::disallowed_methods)]

mod common;

use alarmsrv::store::AlertStore;
use alarmsrv::{
    AlertEvent, AlertLifecycleManager, EscalationScheduler, EventBus, LocalAlarmController,
    MemoryStore, NotificationDispatcher,
};
use aqua_io::MemoryGpioDriver;
use aqua_rules::{AlertStatus, BuzzerMode, EscalationPolicy, EscalationStep};
use crate::common::{acidic_readings, low_ph_rule, neutral_readings, RecordingSender, OPERATOR};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: Arc<NotificationDispatcher>,
    escalation: Arc<EscalationScheduler>,
    events: EventBus,
    manager: AlertLifecycleManager,
    cancel: CancellationToken,
}

fn harness() -> Harness {
    harness_with_throttle(Duration::from_secs(300))
}

fn harness_with_throttle(throttle: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_group(1, &[OPERATOR]);
    let sender = Arc::new(RecordingSender::new());
    let dispatcher = common::dispatcher(&store, &sender);
    let cancel = CancellationToken::new();
    let escalation = Arc::new(EscalationScheduler::new(
        store.clone(),
        dispatcher.clone(),
        cancel.clone(),
    ));
    let events = EventBus::default();
    let manager = AlertLifecycleManager::new(
        store.clone(),
        dispatcher.clone(),
        escalation.clone(),
        events.clone(),
        throttle,
    );
    Harness {
        store,
        dispatcher,
        escalation,
        events,
        manager,
        cancel,
    }
}

#[tokio::test]
async fn test_alert_opens_once_while_condition_holds() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));

    let first = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(first.triggered, vec![1]);
    assert_eq!(first.opened.len(), 1);

    for _ in 0..3 {
        let again = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
        assert_eq!(again.triggered, vec![1]);
        assert!(again.opened.is_empty());
    }

    let history = h.store.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].details, "pH was 3.20");
    assert_eq!(history[0].status, AlertStatus::Triggered);

    let pending = h.dispatcher.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].rule_name, "Acidic water");
    assert_eq!(pending[0].group_id, Some(1));
    assert!(!pending[0].is_escalation);
}

#[tokio::test]
async fn test_clear_resolves_exactly_once() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));

    let opened = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    let history_id = opened.opened[0];

    let cleared = h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert_eq!(cleared.resolved, vec![history_id]);
    assert!(h.manager.active_alerts().await.is_empty());

    h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert_eq!(h.store.resolve_calls(), 1);
    assert_eq!(
        h.store.alert_status(history_id).await.unwrap(),
        Some(AlertStatus::Resolved)
    );
}

#[tokio::test(start_paused = true)]
async fn test_retrigger_after_clear_opens_new_alert() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));

    h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(301)).await;
    let reopened = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();

    assert_eq!(reopened.opened.len(), 1);
    assert_eq!(h.store.history().len(), 2);
    assert_eq!(h.dispatcher.pending_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retrigger_within_throttle_window_waits() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));

    h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    let flapped = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(flapped.triggered, vec![1]);
    assert!(flapped.opened.is_empty());
    assert!(h.manager.active_alerts().await.is_empty());
    assert_eq!(h.store.history().len(), 1);
    assert_eq!(h.dispatcher.pending_len(), 1);

    // window measured from the first notification, not from the clear
    tokio::time::sleep(Duration::from_secs(240)).await;
    let reopened = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(reopened.opened.len(), 1);
    assert_eq!(h.store.history().len(), 2);
    assert_eq!(h.dispatcher.pending_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_throttle_reopens_immediately() {
    let h = harness_with_throttle(Duration::ZERO);
    h.store.add_rule(low_ph_rule(1));

    h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let reopened = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(reopened.opened.len(), 1);
}

#[tokio::test]
async fn test_events_emitted_on_open_and_clear() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));
    let mut rx = h.events.subscribe();

    let opened = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.room, alarmsrv::events::BROADCAST_ROOM);
    match event.event {
        AlertEvent::NewAlert(alert) => {
            assert_eq!(alert.history_id, opened.opened[0]);
            assert_eq!(alert.rule_id, 1);
            assert_eq!(alert.rule_name, "Acidic water");
            assert_eq!(alert.details, "Condition met: pH < 4.0");
        },
        other => panic!("unexpected event {:?}", other),
    }

    h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert_eq!(rx.try_recv().unwrap().event, AlertEvent::AlertCleared);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_open_failure_is_retried_next_cycle() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));

    h.store.fail_writes(true);
    let failed = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(failed.triggered, vec![1]);
    assert!(failed.opened.is_empty());
    assert!(h.store.history().is_empty());
    assert_eq!(h.dispatcher.pending_len(), 0);

    h.store.fail_writes(false);
    let retried = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(retried.opened.len(), 1);
    assert_eq!(h.dispatcher.pending_len(), 1);
}

#[tokio::test]
async fn test_resolve_failure_keeps_alert_active() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));
    let opened = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();

    h.store.fail_writes(true);
    let failed = h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert!(failed.resolved.is_empty());
    assert_eq!(h.manager.active_alerts().await.len(), 1);

    h.store.fail_writes(false);
    let retried = h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert_eq!(retried.resolved, opened.opened);
    assert!(h.manager.active_alerts().await.is_empty());
}

#[tokio::test]
async fn test_rule_fetch_failure_changes_nothing() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));
    h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();

    h.store.fail_rule_fetch(true);
    assert!(h.manager.evaluate_cycle(&neutral_readings()).await.is_err());
    assert_eq!(h.manager.active_alerts().await.len(), 1);
    assert_eq!(h.store.resolve_calls(), 0);
}

#[tokio::test]
async fn test_snoozed_rule_is_treated_as_cleared() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));
    h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();

    assert!(h.store.snooze_rule(1, 30).await.unwrap());
    let outcome = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert!(outcome.triggered.is_empty());
    assert_eq!(outcome.resolved.len(), 1);
}

#[tokio::test]
async fn test_disabled_rule_never_opens() {
    let h = harness();
    let mut rule = low_ph_rule(1);
    rule.enabled = false;
    h.store.add_rule(rule);

    let outcome = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert!(outcome.triggered.is_empty());
    assert!(h.store.history().is_empty());
}

#[tokio::test]
async fn test_escalation_started_only_with_policy() {
    let h = harness();
    h.store.add_rule(low_ph_rule(1));
    h.store.add_rule(low_ph_rule(2).with_policy(7));
    h.store.add_policy(EscalationPolicy {
        id: 7,
        name: "Night shift".to_string(),
        path: vec![EscalationStep::new(10, 1)],
    });

    let outcome = h.manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    assert_eq!(outcome.opened.len(), 2);
    let active = h.manager.active_alerts().await;
    assert!(!h.escalation.is_running(active[&1]));
    assert!(h.escalation.is_running(active[&2]));

    h.manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert!(!h.escalation.is_running(active[&2]));
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_buzzer_follows_active_alerts() {
    let h = harness();
    h.store
        .add_rule(low_ph_rule(1).with_buzzer(BuzzerMode::Repeating, 5));

    let driver = Arc::new(MemoryGpioDriver::new());
    let buzzer = Arc::new(LocalAlarmController::new(
        driver.clone(),
        17,
        Duration::from_secs(1),
    ));
    buzzer.setup().unwrap();
    let manager = AlertLifecycleManager::new(
        h.store.clone(),
        h.dispatcher.clone(),
        h.escalation.clone(),
        h.events.clone(),
        Duration::from_secs(300),
    )
    .with_buzzer(buzzer.clone());

    manager.evaluate_cycle(&acidic_readings()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(driver.level(17));

    manager.evaluate_cycle(&neutral_readings()).await.unwrap();
    assert!(!driver.level(17));
    assert_eq!(buzzer.current_pattern(), None);
}
