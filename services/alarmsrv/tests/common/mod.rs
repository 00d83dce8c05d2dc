//! Shared fixtures for alarmsrv integration tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)]

use alarmsrv::{DispatchSettings, MemoryStore, NotificationDispatcher};
use aqua_io::SmsSender;
use aqua_rules::{AlertRule, Condition, Operator, Readings};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const OPERATOR: &str = "+639170000001";
pub const SUPERVISOR: &str = "+639170000002";
pub const MANAGER: &str = "+639170000003";

#[derive(Debug, Clone)]
pub struct SentSms {
    pub at: Instant,
    pub number: String,
    pub body: String,
}

/// SMS sender that records every attempt
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentSms>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends to `number` report failure (still recorded)
    pub fn fail_for(&self, number: &str) {
        self.failing.lock().insert(number.to_string());
    }

    pub fn sent(&self) -> Vec<SentSms> {
        self.sent.lock().clone()
    }

    pub fn numbers(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.number.clone()).collect()
    }
}

#[async_trait]
impl SmsSender for RecordingSender {
    async fn send(&self, number: &str, body: &str) -> bool {
        self.sent.lock().push(SentSms {
            at: Instant::now(),
            number: number.to_string(),
            body: body.to_string(),
        });
        !self.failing.lock().contains(number)
    }
}

pub fn settings(send_interval: Duration) -> DispatchSettings {
    DispatchSettings {
        send_interval,
        ..DispatchSettings::default()
    }
}

pub fn dispatcher(
    store: &Arc<MemoryStore>,
    sender: &Arc<RecordingSender>,
) -> Arc<NotificationDispatcher> {
    Arc::new(NotificationDispatcher::new(
        store.clone(),
        sender.clone(),
        settings(Duration::from_secs(5)),
    ))
}

/// `pH < 4.0` notifying group 1
pub fn low_ph_rule(id: i64) -> AlertRule {
    AlertRule::new(id, "Acidic water", vec![Condition::new("pH", Operator::Lt, 4.0)]).with_group(1)
}

pub fn acidic_readings() -> Readings {
    Readings::new().with("ph", 3.2).with("temperature", 25.0)
}

pub fn neutral_readings() -> Readings {
    Readings::new().with("ph", 7.0).with("temperature", 25.0)
}
