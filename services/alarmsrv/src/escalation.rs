//! Per-alert escalation workers
//!
//! Each open alert whose rule has an escalation policy gets one worker. The
//! worker walks the policy's steps in order, sleeping for each step's wait
//! and then reading the alert's status from the store. It escalates only
//! while the alert is still `Triggered`; any other status (or a failed read)
//! ends it. Workers are never aborted by the lifecycle manager; the shared
//! cancellation token only exists for process shutdown.

use crate::dispatcher::{NotificationDispatcher, SmsTask};
use crate::store::AlertStore;
use aqua_rules::{AlertStatus, Readings};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct EscalationScheduler {
    store: Arc<dyn AlertStore>,
    dispatcher: Arc<NotificationDispatcher>,
    workers: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
    cancel: CancellationToken,
}

struct EscalationJob {
    history_id: i64,
    policy_id: i64,
    rule_name: String,
    readings: Readings,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<dyn AlertStore>,
        dispatcher: Arc<NotificationDispatcher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            workers: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        }
    }

    /// Start a worker for `history_id`; returns false if one is already running
    pub fn start(
        &self,
        history_id: i64,
        policy_id: i64,
        rule_name: &str,
        readings: Readings,
    ) -> bool {
        let mut workers = self.workers.lock();
        if workers.contains_key(&history_id) {
            debug!(history_id, "Escalation worker already running");
            return false;
        }

        let job = EscalationJob {
            history_id,
            policy_id,
            rule_name: rule_name.to_string(),
            readings,
        };
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let registry = Arc::clone(&self.workers);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            run_policy(&job, store.as_ref(), &dispatcher, &cancel).await;
            registry.lock().remove(&job.history_id);
            debug!(history_id = job.history_id, "Escalation worker finished");
        });
        workers.insert(history_id, handle);
        info!(history_id, policy_id, "Escalation worker started");
        true
    }

    /// Stop tracking `history_id`; the worker ends on its own once it sees
    /// the alert is no longer `Triggered`
    pub fn forget(&self, history_id: i64) {
        if self.workers.lock().remove(&history_id).is_some() {
            debug!(history_id, "Escalation worker will self-terminate");
        }
    }

    pub fn is_running(&self, history_id: i64) -> bool {
        self.workers.lock().contains_key(&history_id)
    }

    pub fn active_count(&self) -> usize {
        self.workers.lock().len()
    }
}

async fn run_policy(
    job: &EscalationJob,
    store: &dyn AlertStore,
    dispatcher: &NotificationDispatcher,
    cancel: &CancellationToken,
) {
    let history_id = job.history_id;
    let policy = match store.escalation_policy(job.policy_id).await {
        Ok(Some(policy)) if !policy.path.is_empty() => policy,
        Ok(_) => {
            info!(history_id, policy_id = job.policy_id, "No escalation path, nothing to do");
            return;
        },
        Err(e) => {
            error!(history_id, "Failed to load escalation policy {}: {}", job.policy_id, e);
            return;
        },
    };

    for (index, step) in policy.path.iter().enumerate() {
        let Some((wait_minutes, group_id)) = step.actionable() else {
            debug!(history_id, step = index, "Skipping escalation step without wait or group");
            continue;
        };

        debug!(history_id, "Waiting {} minute(s) before step {}", wait_minutes, index);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(wait_minutes.saturating_mul(60))) => {},
            _ = cancel.cancelled() => {
                debug!(history_id, "Escalation cancelled by shutdown");
                return;
            }
        }

        match store.alert_status(history_id).await {
            Ok(Some(AlertStatus::Triggered)) => {
                info!(history_id, group_id, "Alert unacknowledged, escalating");
                dispatcher.enqueue(SmsTask::escalation(
                    job.rule_name.clone(),
                    group_id,
                    job.readings.clone(),
                ));
            },
            Ok(status) => {
                info!(history_id, ?status, "Alert handled, stopping escalation");
                return;
            },
            Err(e) => {
                error!(history_id, "Failed to read alert status, stopping escalation: {}", e);
                return;
            },
        }
    }
}
