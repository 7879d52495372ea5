//! iMessage alias deregistration handler

use std::sync::Arc;

use async_trait::async_trait;
use pa_core::{Notification, Notifier};
use serde_json::json;
use tracing::warn;

use super::{EventHandler, HelperEvent, IncomingEvent, notifications, types};
use crate::connection::ConnectionInfo;
use crate::error::Result;

/// Raises a high priority notification when aliases are deregistered
pub struct AliasDeregistrationHandler {
    notifier: Arc<dyn Notifier>,
}

impl AliasDeregistrationHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl EventHandler for AliasDeregistrationHandler {
    fn name(&self) -> &'static str {
        "alias-deregistration"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[types::ALIASES_REMOVED]
    }

    async fn handle(&self, event: &IncomingEvent, _connection: &ConnectionInfo) -> Result<()> {
        let aliases: &[String] = match &event.kind {
            HelperEvent::AliasesRemoved { aliases } => aliases.as_slice(),
            _ => &[],
        };

        if aliases.is_empty() {
            warn!("Received alias deregistration event without any aliases");
            return Ok(());
        }

        warn!("iMessage aliases deregistered: {}", aliases.join(", "));
        self.notifier.notify(Notification::high(
            notifications::ALIASES_REMOVED,
            json!({ "aliases": aliases }),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_core::{ChannelNotifier, NotificationPriority};
    use uuid::Uuid;

    fn event(aliases: &[&str]) -> IncomingEvent {
        IncomingEvent {
            name: types::ALIASES_REMOVED.to_string(),
            guid: None,
            process: None,
            kind: HelperEvent::AliasesRemoved {
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            },
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            id: Uuid::new_v4(),
            peer: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_emits_high_priority() {
        let notifier = Arc::new(ChannelNotifier::new(4));
        let mut rx = notifier.subscribe();
        let handler = AliasDeregistrationHandler::new(notifier);

        handler.handle(&event(&["me@icloud.com"]), &conn()).await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.event, "imessage-aliases-removed");
        assert_eq!(n.priority, NotificationPriority::High);
        assert_eq!(n.payload, json!({"aliases": ["me@icloud.com"]}));
    }

    #[tokio::test]
    async fn test_empty_list_is_noop() {
        let notifier = Arc::new(ChannelNotifier::new(4));
        let mut rx = notifier.subscribe();
        let handler = AliasDeregistrationHandler::new(notifier);

        handler.handle(&event(&[]), &conn()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
