//! Helper event routing
//!
//! Incoming event envelopes are decoded into a typed `HelperEvent` and
//! handed to every registered handler that declared interest in the
//! event's type string.

pub mod aliases;
pub mod facetime;
pub mod findmy;
pub mod ping;
pub mod typing;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::ConnectionInfo;
use crate::error::Result;
use crate::protocol::EventEnvelope;

pub use aliases::AliasDeregistrationHandler;
pub use facetime::{CallStatus, FaceTimeCallStatus, FaceTimeStatusHandler};
pub use findmy::{FindMyLocation, FindMyLocationCache, FindMyLocationHandler};
pub use ping::PingHandler;
pub use typing::TypingHandler;

/// Event type strings sent by the helper
pub mod types {
    pub const STARTED_TYPING: &str = "started-typing";
    pub const TYPING: &str = "typing";
    pub const STOPPED_TYPING: &str = "stopped-typing";
    pub const PING: &str = "ping";
    pub const FACETIME_CALL_STATUS: &str = "ft-call-status-changed";
    pub const FINDMY_LOCATION: &str = "new-findmy-location";
    pub const ALIASES_REMOVED: &str = "aliases-removed";
}

/// Notification names published downstream
pub mod notifications {
    pub const TYPING_INDICATOR: &str = "typing-indicator";
    pub const FACETIME_CALL_STATUS: &str = "ft-call-status-changed";
    pub const FINDMY_LOCATION: &str = "new-findmy-location";
    pub const ALIASES_REMOVED: &str = "imessage-aliases-removed";
}

/// Typed payload of a helper event
#[derive(Debug, Clone, PartialEq)]
pub enum HelperEvent {
    Typing { guid: String, display: bool },
    Ping { process: Option<String> },
    FaceTimeStatus(FaceTimeCallStatus),
    FindMyLocations(Vec<FindMyLocation>),
    AliasesRemoved { aliases: Vec<String> },
    /// Unrecognized type, or a known type with an unusable payload
    Unknown { payload: Value },
}

/// A decoded event together with its envelope metadata
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    /// Event type string as sent by the helper
    pub name: String,
    pub guid: Option<String>,
    pub process: Option<String>,
    pub kind: HelperEvent,
}

impl IncomingEvent {
    /// Decode an envelope by its type tag
    pub fn from_envelope(envelope: EventEnvelope) -> Self {
        let EventEnvelope {
            event,
            guid,
            process,
            data,
            ..
        } = envelope;

        let kind = match event.as_str() {
            types::STARTED_TYPING | types::TYPING | types::STOPPED_TYPING => match &guid {
                Some(guid) => HelperEvent::Typing {
                    guid: guid.clone(),
                    display: event != types::STOPPED_TYPING,
                },
                None => HelperEvent::Unknown { payload: data },
            },
            types::PING => HelperEvent::Ping {
                process: process.clone(),
            },
            types::FACETIME_CALL_STATUS => match FaceTimeCallStatus::from_value(&data) {
                Some(status) => HelperEvent::FaceTimeStatus(status),
                None => HelperEvent::Unknown { payload: data },
            },
            types::FINDMY_LOCATION => decode_or_unknown(&event, data, HelperEvent::FindMyLocations),
            types::ALIASES_REMOVED => HelperEvent::AliasesRemoved {
                aliases: decode_aliases(&data),
            },
            _ => HelperEvent::Unknown { payload: data },
        };

        Self {
            name: event,
            guid,
            process,
            kind,
        }
    }
}

fn decode_or_unknown<T, F>(event: &str, data: Value, wrap: F) -> HelperEvent
where
    T: for<'de> Deserialize<'de>,
    F: FnOnce(T) -> HelperEvent,
{
    match serde_json::from_value::<T>(data.clone()) {
        Ok(decoded) => wrap(decoded),
        Err(e) => {
            warn!("Malformed '{}' event payload: {}", event, e);
            HelperEvent::Unknown { payload: data }
        }
    }
}

fn decode_aliases(data: &Value) -> Vec<String> {
    let empty: &[Value] = &[];
    let list: &[Value] = match data {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("aliases") {
            Some(Value::Array(items)) => items,
            _ => empty,
        },
        _ => empty,
    };
    list.iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Consumer of helper events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Event type strings this handler consumes
    fn event_types(&self) -> &'static [&'static str];

    async fn handle(&self, event: &IncomingEvent, connection: &ConnectionInfo) -> Result<()>;
}

/// Registered event handlers
#[derive(Default, Clone)]
pub struct EventHandlerSet {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventHandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        debug!(
            "Registered event handler {} for {:?}",
            handler.name(),
            handler.event_types()
        );
        self.handlers.push(handler);
    }

    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every interested handler in registration order
    ///
    /// A failing handler is logged and does not stop the others. Returns
    /// the number of handlers that ran.
    pub async fn dispatch(&self, event: &IncomingEvent, connection: &ConnectionInfo) -> usize {
        let mut ran = 0;
        for handler in &self.handlers {
            if !handler.event_types().contains(&event.name.as_str()) {
                continue;
            }
            ran += 1;
            if let Err(e) = handler.handle(event, connection).await {
                error!(
                    "Event handler {} failed on '{}': {}",
                    handler.name(),
                    event.name,
                    e
                );
            }
        }

        if ran == 0 {
            debug!("No handler for helper event '{}'", event.name);
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn envelope(event: &str, guid: Option<&str>, data: Value) -> EventEnvelope {
        EventEnvelope {
            event: event.to_string(),
            guid: guid.map(str::to_string),
            process: None,
            data,
            extra: Default::default(),
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            id: Uuid::new_v4(),
            peer: "test".to_string(),
        }
    }

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn event_types(&self) -> &'static [&'static str] {
            &[types::PING]
        }

        async fn handle(&self, _event: &IncomingEvent, _conn: &ConnectionInfo) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BridgeError::Mode("handler exploded".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_decode_typing() {
        let started = IncomingEvent::from_envelope(envelope(
            "started-typing",
            Some("iMessage;-;+15555550123"),
            Value::Null,
        ));
        assert_eq!(
            started.kind,
            HelperEvent::Typing {
                guid: "iMessage;-;+15555550123".to_string(),
                display: true
            }
        );

        let stopped =
            IncomingEvent::from_envelope(envelope("stopped-typing", Some("g"), Value::Null));
        assert!(matches!(stopped.kind, HelperEvent::Typing { display: false, .. }));

        let no_guid = IncomingEvent::from_envelope(envelope("typing", None, Value::Null));
        assert!(matches!(no_guid.kind, HelperEvent::Unknown { .. }));
    }

    #[test]
    fn test_decode_aliases_shapes() {
        let listed = IncomingEvent::from_envelope(envelope(
            "aliases-removed",
            None,
            json!({"aliases": ["a@icloud.com"]}),
        ));
        assert_eq!(
            listed.kind,
            HelperEvent::AliasesRemoved {
                aliases: vec!["a@icloud.com".to_string()]
            }
        );

        let bare = IncomingEvent::from_envelope(envelope("aliases-removed", None, json!(["x"])));
        assert!(matches!(bare.kind, HelperEvent::AliasesRemoved { ref aliases } if aliases.len() == 1));
    }

    #[test]
    fn test_decode_malformed_findmy() {
        let event =
            IncomingEvent::from_envelope(envelope("new-findmy-location", None, json!("nope")));
        assert!(matches!(event.kind, HelperEvent::Unknown { .. }));
    }

    #[test]
    fn test_decode_unknown_type() {
        let event = IncomingEvent::from_envelope(envelope("mystery", None, json!({"x": 1})));
        assert_eq!(event.name, "mystery");
        assert_eq!(
            event.kind,
            HelperEvent::Unknown {
                payload: json!({"x": 1})
            }
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let failing = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let set = EventHandlerSet::new()
            .with(failing.clone())
            .with(healthy.clone());

        let event = IncomingEvent::from_envelope(envelope("ping", None, Value::Null));
        assert_eq!(set.dispatch(&event, &conn()).await, 2);
        assert_eq!(set.dispatch(&event, &conn()).await, 2);

        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_uninterested_handlers_skipped() {
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let set = EventHandlerSet::new().with(handler.clone());

        let event = IncomingEvent::from_envelope(envelope("stopped-typing", Some("g"), Value::Null));
        assert_eq!(set.dispatch(&event, &conn()).await, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
