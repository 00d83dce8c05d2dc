//! SMS notification dispatcher
//!
//! Alert and escalation notifications are queued without blocking the caller
//! and delivered by one worker in submission order. The worker resolves the
//! target group to phone numbers at send time and paces the modem between
//! numbers.

use crate::message::build_alert_message;
use crate::queue::BoundedQueue;
use crate::store::{local_now, AlertStore};
use aqua_io::SmsSender;
use aqua_rules::Readings;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One queued notification
#[derive(Debug, Clone, PartialEq)]
pub struct SmsTask {
    pub rule_name: String,
    pub group_id: Option<i64>,
    /// Readings at the time the alert opened
    pub readings: Readings,
    pub is_escalation: bool,
}

impl SmsTask {
    pub fn initial(rule_name: impl Into<String>, group_id: Option<i64>, readings: Readings) -> Self {
        Self {
            rule_name: rule_name.into(),
            group_id,
            readings,
            is_escalation: false,
        }
    }

    pub fn escalation(rule_name: impl Into<String>, group_id: i64, readings: Readings) -> Self {
        Self {
            rule_name: rule_name.into(),
            group_id: Some(group_id),
            readings,
            is_escalation: true,
        }
    }
}

/// Sender used when no modem is available; every send fails
pub struct DisabledSmsSender;

#[async_trait]
impl SmsSender for DisabledSmsSender {
    async fn send(&self, number: &str, _body: &str) -> bool {
        warn!("SMS to {} dropped: modem not available", number);
        false
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub device_id: String,
    pub product_name: String,
    pub queue_capacity: usize,
    pub send_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            device_id: "dev-1".to_string(),
            product_name: "AquaWatch".to_string(),
            queue_capacity: 50,
            send_interval: Duration::from_secs(5),
        }
    }
}

pub struct NotificationDispatcher {
    queue: BoundedQueue<SmsTask>,
    store: Arc<dyn AlertStore>,
    sender: Arc<dyn SmsSender>,
    settings: DispatchSettings,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn AlertStore>,
        sender: Arc<dyn SmsSender>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue: BoundedQueue::new(settings.queue_capacity),
            store,
            sender,
            settings,
        }
    }

    /// Queue a notification; never blocks, evicts the oldest task when full
    pub fn enqueue(&self, task: SmsTask) {
        debug!(
            rule = %task.rule_name,
            group_id = ?task.group_id,
            escalation = task.is_escalation,
            "Queueing SMS task"
        );
        if let Some(dropped) = self.queue.push(task) {
            warn!("SMS queue full, dropped task for rule '{}'", dropped.rule_name);
        }
    }

    /// Tasks waiting for the worker, oldest first
    pub fn pending(&self) -> Vec<SmsTask> {
        self.queue.snapshot()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Spawn the worker; it exits when `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run(cancel).await })
    }

    /// Worker loop: deliver queued tasks one at a time
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting SMS dispatcher");
        while let Some(task) = self.queue.recv(&cancel).await {
            self.deliver(&task, &cancel).await;
        }
        info!("SMS dispatcher stopped");
    }

    async fn deliver(&self, task: &SmsTask, cancel: &CancellationToken) {
        let Some(group_id) = task.group_id else {
            debug!("SMS task for '{}' has no group, skipping", task.rule_name);
            return;
        };
        if task.rule_name.is_empty() || task.readings.is_empty() {
            debug!("Incomplete SMS task for group {}, skipping", group_id);
            return;
        }

        let numbers = match self.store.group_phone_numbers(group_id).await {
            Ok(numbers) if !numbers.is_empty() => numbers,
            Ok(_) => {
                info!("Group {} has no valid phone numbers, skipping", group_id);
                return;
            },
            Err(e) => {
                error!("Failed to load phone numbers for group {}: {}", group_id, e);
                return;
            },
        };

        let location = match self.store.device_info(&self.settings.device_id).await {
            Ok(device) => device.and_then(|d| d.location),
            Err(e) => {
                warn!("Failed to load device info: {}", e);
                None
            },
        };

        let body = build_alert_message(
            &self.settings.product_name,
            &task.rule_name,
            &task.readings,
            location.as_deref(),
            task.is_escalation,
            local_now(),
        );
        info!(
            group_id,
            escalation = task.is_escalation,
            "Sending alert for rule '{}' to {} number(s)",
            task.rule_name,
            numbers.len()
        );

        for number in &numbers {
            // a modem send can run for minutes; shutdown abandons it
            let sent = tokio::select! {
                sent = self.sender.send(number, &body) => sent,
                _ = cancel.cancelled() => {
                    warn!("Shutdown while sending to {}, SMS abandoned", number);
                    return;
                }
            };
            if !sent {
                warn!("SMS to {} failed for rule '{}'", number, task.rule_name);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.send_interval) => {},
                _ = cancel.cancelled() => return,
            }
        }
    }
}
