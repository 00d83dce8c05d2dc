//! AlarmSrv library
//!
//! Evaluates water-quality alert rules against sensor readings, tracks the
//! resulting alerts in SQLite, and notifies people by SMS with timed
//! escalation. A local buzzer sounds while alerts are active.

pub mod buzzer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod escalation;
pub mod events;
pub mod lifecycle;
pub mod message;
pub mod queue;
pub mod service;
pub mod store;

pub use buzzer::{LocalAlarmController, PatternKind};
pub use config::AlarmConfig;
pub use dispatcher::{DisabledSmsSender, DispatchSettings, NotificationDispatcher, SmsTask};
pub use error::{AlarmError, Result};
pub use escalation::EscalationScheduler;
pub use events::{AlertEvent, EventBus, NewAlert, RoomEvent};
pub use lifecycle::{AlertLifecycleManager, CycleOutcome};
pub use service::AlarmEngine;
pub use store::{
    AlertHistoryRecord, AlertStore, DeviceInfo, Measurement, MemoryStore, SqliteStore,
};
