//! Notification dispatch collaborator
//!
//! Normalized helper events are published downstream (UI push, clients)
//! through a `Notifier` handed to each component at construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Delivery priority of a notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    #[default]
    Normal,
    High,
}

/// A normalized event published to downstream consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Downstream event name (e.g. `typing-indicator`)
    pub event: String,
    /// Event payload
    pub payload: Value,
    /// Delivery priority
    pub priority: NotificationPriority,
    /// When the notification was produced
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Create a normal priority notification
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            priority: NotificationPriority::Normal,
            created_at: Utc::now(),
        }
    }

    /// Create a high priority notification
    pub fn high(event: impl Into<String>, payload: Value) -> Self {
        Self {
            priority: NotificationPriority::High,
            ..Self::new(event, payload)
        }
    }
}

/// Publishes notifications downstream
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            "Notification [{:?}] {}: {}",
            notification.priority, notification.event, notification.payload
        );
    }
}

/// Fans notifications out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to published notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Notification dropped: no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let notifier = ChannelNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.notify(Notification::high("imessage-aliases-removed", json!({"aliases": ["a"]})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, "imessage-aliases-removed");
        assert_eq!(received.priority, NotificationPriority::High);
    }

    #[test]
    fn test_channel_notifier_without_subscribers() {
        let notifier = ChannelNotifier::new(1);
        notifier.notify(Notification::new("typing-indicator", json!({})));
    }
}
