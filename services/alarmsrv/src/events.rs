//! Real-time alert events for dashboard subscribers

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Subscription room every dashboard client joins
pub const BROADCAST_ROOM: &str = "broadcast_room";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAlert {
    #[serde(rename = "id")]
    pub history_id: i64,
    pub rule_id: i64,
    pub rule_name: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AlertEvent {
    NewAlert(NewAlert),
    AlertCleared,
}

impl AlertEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AlertEvent::NewAlert(_) => "new_alert",
            AlertEvent::AlertCleared => "alert_cleared",
        }
    }
}

/// An event addressed to a room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomEvent {
    pub room: String,
    #[serde(flatten)]
    pub event: AlertEvent,
}

/// Broadcast channel for alert events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }

    /// Publish to the broadcast room; having no subscribers is fine
    pub fn emit(&self, event: AlertEvent) {
        let name = event.name();
        let message = RoomEvent {
            room: BROADCAST_ROOM.to_string(),
            event,
        };
        if self.sender.send(message).is_err() {
            debug!("No subscribers for '{}' event", name);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
