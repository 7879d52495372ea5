//! Typing indicator handler

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use pa_core::{Notification, Notifier};
use serde_json::json;
use tracing::debug;

use super::{EventHandler, HelperEvent, IncomingEvent, notifications, types};
use crate::connection::ConnectionInfo;
use crate::error::Result;

/// Marker present in group chat guids
const GROUP_CHAT_MARKER: &str = ";+;";

#[derive(Debug, Clone, Copy)]
struct LastEmission {
    display: bool,
    at: Instant,
}

/// Coalesces typing events before publishing `typing-indicator`
///
/// A state is published when it differs from the last published state for
/// that chat, or when the debounce window has passed since then. Group
/// chats are ignored; the helper's typing state is unreliable there.
pub struct TypingHandler {
    notifier: Arc<dyn Notifier>,
    debounce: Duration,
    last: DashMap<String, LastEmission>,
}

impl TypingHandler {
    pub fn new(notifier: Arc<dyn Notifier>, debounce: Duration) -> Self {
        Self {
            notifier,
            debounce,
            last: DashMap::new(),
        }
    }

    /// Decide whether a typing state observed at `now` should be published
    pub fn should_emit(&self, guid: &str, display: bool, now: Instant) -> bool {
        if guid.contains(GROUP_CHAT_MARKER) {
            return false;
        }

        let current = LastEmission { display, at: now };
        let mut emit = true;
        self.last
            .entry(guid.to_string())
            .and_modify(|prev| {
                emit = prev.display != display
                    || now.saturating_duration_since(prev.at) > self.debounce;
                if emit {
                    *prev = current;
                }
            })
            .or_insert(current);
        emit
    }
}

#[async_trait]
impl EventHandler for TypingHandler {
    fn name(&self) -> &'static str {
        "typing"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[types::STARTED_TYPING, types::TYPING, types::STOPPED_TYPING]
    }

    async fn handle(&self, event: &IncomingEvent, _connection: &ConnectionInfo) -> Result<()> {
        let HelperEvent::Typing { guid, display } = &event.kind else {
            debug!("Typing event without a chat guid");
            return Ok(());
        };

        if self.should_emit(guid, *display, Instant::now()) {
            self.notifier.notify(Notification::new(
                notifications::TYPING_INDICATOR,
                json!({ "display": display, "guid": guid }),
            ));
        }
        Ok(())
    }
}
