//! FaceTime call status handler

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pa_core::{HandleResolver, Notification, Notifier};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{EventHandler, HelperEvent, IncomingEvent, notifications, types};
use crate::connection::ConnectionInfo;
use crate::error::Result;
use crate::session::FaceTimeSessions;

/// How long a call+status pair is remembered for deduplication
const SEEN_WINDOW: Duration = Duration::from_secs(60);

/// Call status as reported by the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Answered,
    Outgoing,
    Incoming,
    Disconnecting,
    Disconnected,
    Unknown,
}

impl CallStatus {
    /// Accepts the helper's numeric codes or their names
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(1) => CallStatus::Answered,
                Some(3) => CallStatus::Outgoing,
                Some(4) => CallStatus::Incoming,
                Some(5) => CallStatus::Disconnecting,
                Some(6) => CallStatus::Disconnected,
                _ => CallStatus::Unknown,
            },
            Value::String(s) => match s.to_lowercase().as_str() {
                "answered" | "active" => CallStatus::Answered,
                "outgoing" | "sending" => CallStatus::Outgoing,
                "incoming" | "ringing" => CallStatus::Incoming,
                "disconnecting" => CallStatus::Disconnecting,
                "disconnected" => CallStatus::Disconnected,
                _ => CallStatus::Unknown,
            },
            _ => CallStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Answered => "answered",
            CallStatus::Outgoing => "outgoing",
            CallStatus::Incoming => "incoming",
            CallStatus::Disconnecting => "disconnecting",
            CallStatus::Disconnected => "disconnected",
            CallStatus::Unknown => "unknown",
        }
    }
}

/// Payload of `ft-call-status-changed`
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTimeCallStatus {
    pub call_uuid: String,
    pub status: CallStatus,
    /// Raw status value as sent
    pub status_id: Value,
    pub handle: Option<String>,
    pub is_outgoing: bool,
    pub is_audio: bool,
    pub is_video: bool,
    pub ended_error: Option<String>,
    pub ended_reason: Option<String>,
    pub image_url: Option<String>,
}

impl FaceTimeCallStatus {
    /// Decode from the event's `data`; `None` without a call uuid
    pub fn from_value(data: &Value) -> Option<Self> {
        let call_uuid = data.get("call_uuid").and_then(Value::as_str)?.to_string();
        let status_id = data.get("call_status").cloned().unwrap_or(Value::Null);
        let string = |key: &str| {
            data.get(key)
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
        };
        let flag = |key: &str| match data.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        };

        Some(Self {
            call_uuid,
            status: CallStatus::from_value(&status_id),
            status_id,
            handle: string("handle"),
            is_outgoing: flag("is_outgoing"),
            is_audio: flag("is_sending_audio"),
            is_video: flag("is_sending_video"),
            ended_error: string("ended_error"),
            ended_reason: string("ended_reason"),
            image_url: string("image_url"),
        })
    }
}

/// Normalizes call status changes and publishes them downstream
pub struct FaceTimeStatusHandler {
    notifier: Arc<dyn Notifier>,
    resolver: Arc<dyn HandleResolver>,
    sessions: Arc<FaceTimeSessions>,
    seen: DashMap<String, Instant>,
}

impl FaceTimeStatusHandler {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        resolver: Arc<dyn HandleResolver>,
        sessions: Arc<FaceTimeSessions>,
    ) -> Self {
        Self {
            notifier,
            resolver,
            sessions,
            seen: DashMap::new(),
        }
    }

    /// Record a call+status pair; `false` if it was already handled recently
    pub fn first_sighting(&self, call: &FaceTimeCallStatus, now: Instant) -> bool {
        let key = format!("{}:{}", call.call_uuid, call.status.as_str());
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) <= SEEN_WINDOW);

        match self.seen.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    async fn normalize(&self, call: &FaceTimeCallStatus) -> Value {
        let address = match &call.handle {
            Some(handle) => self
                .resolver
                .resolve_address(handle)
                .await
                .or_else(|| Some(handle.clone())),
            None => None,
        };

        json!({
            "uuid": call.call_uuid,
            "status": call.status.as_str(),
            "status_id": call.status_id,
            "address": address,
            "ended_error": call.ended_error,
            "ended_reason": call.ended_reason,
            "image_url": call.image_url,
            "is_outgoing": call.is_outgoing,
            "is_audio": call.is_audio,
            "is_video": call.is_video,
        })
    }
}

#[async_trait]
impl EventHandler for FaceTimeStatusHandler {
    fn name(&self) -> &'static str {
        "facetime-status"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[types::FACETIME_CALL_STATUS]
    }

    async fn handle(&self, event: &IncomingEvent, _connection: &ConnectionInfo) -> Result<()> {
        let HelperEvent::FaceTimeStatus(call) = &event.kind else {
            debug!("FaceTime status event without a call uuid");
            return Ok(());
        };

        if call.is_outgoing || matches!(call.status, CallStatus::Outgoing | CallStatus::Answered) {
            debug!(
                "Ignoring FaceTime call {} in state {}",
                call.call_uuid,
                call.status.as_str()
            );
            return Ok(());
        }

        if !self.first_sighting(call, Instant::now()) {
            debug!(
                "Already handled FaceTime call {} ({})",
                call.call_uuid,
                call.status.as_str()
            );
            return Ok(());
        }

        if call.status == CallStatus::Disconnected {
            self.sessions.invalidate(&call.call_uuid);
        }

        let payload = self.normalize(call).await;
        info!(
            "FaceTime call {} is now {}",
            call.call_uuid,
            call.status.as_str()
        );
        self.notifier.notify(Notification::new(
            notifications::FACETIME_CALL_STATUS,
            payload,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_core::{ChannelNotifier, StaticHandleResolver};
    use uuid::Uuid;

    fn event(data: Value) -> IncomingEvent {
        IncomingEvent {
            name: types::FACETIME_CALL_STATUS.to_string(),
            guid: None,
            process: None,
            kind: HelperEvent::FaceTimeStatus(FaceTimeCallStatus::from_value(&data).unwrap()),
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            id: Uuid::new_v4(),
            peer: "test".to_string(),
        }
    }

    fn setup() -> (
        FaceTimeStatusHandler,
        tokio::sync::broadcast::Receiver<Notification>,
        Arc<FaceTimeSessions>,
    ) {
        let notifier = Arc::new(ChannelNotifier::new(16));
        let rx = notifier.subscribe();
        let resolver = Arc::new(StaticHandleResolver::new());
        resolver.insert("h-1", "+15555550123");
        let sessions = Arc::new(FaceTimeSessions::new());
        let handler = FaceTimeStatusHandler::new(notifier, resolver, sessions.clone());
        (handler, rx, sessions)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CallStatus::from_value(&json!(4)), CallStatus::Incoming);
        assert_eq!(CallStatus::from_value(&json!(6)), CallStatus::Disconnected);
        assert_eq!(CallStatus::from_value(&json!("Outgoing")), CallStatus::Outgoing);
        assert_eq!(CallStatus::from_value(&json!(null)), CallStatus::Unknown);
    }

    #[test]
    fn test_missing_uuid_is_undecodable() {
        assert!(FaceTimeCallStatus::from_value(&json!({"call_status": 4})).is_none());
    }

    #[tokio::test]
    async fn test_incoming_call_emitted_once() {
        let (handler, mut rx, _) = setup();
        let incoming = event(json!({"call_uuid": "c1", "call_status": 4, "handle": "h-1"}));

        handler.handle(&incoming, &conn()).await.unwrap();
        handler.handle(&incoming, &conn()).await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.event, "ft-call-status-changed");
        assert_eq!(n.payload["address"], "+15555550123");
        assert_eq!(n.payload["status"], "incoming");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outgoing_and_answered_ignored() {
        let (handler, mut rx, _) = setup();
        handler
            .handle(&event(json!({"call_uuid": "c2", "call_status": 3})), &conn())
            .await
            .unwrap();
        handler
            .handle(&event(json!({"call_uuid": "c2", "call_status": 1})), &conn())
            .await
            .unwrap();
        handler
            .handle(
                &event(json!({"call_uuid": "c3", "call_status": 4, "is_outgoing": true})),
                &conn(),
            )
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_session() {
        let (handler, mut rx, sessions) = setup();
        sessions.track("c4");

        handler
            .handle(
                &event(json!({"call_uuid": "c4", "call_status": 6, "handle": "unknown"})),
                &conn(),
            )
            .await
            .unwrap();

        assert!(sessions.get("c4").is_none());
        let n = rx.recv().await.unwrap();
        assert_eq!(n.payload["status"], "disconnected");
        assert_eq!(n.payload["address"], "unknown");
    }

    #[test]
    fn test_sighting_expires() {
        let (handler, _rx, _) = setup();
        let call = FaceTimeCallStatus::from_value(&json!({"call_uuid": "c5", "call_status": 4}))
            .unwrap();
        let t0 = Instant::now();

        assert!(handler.first_sighting(&call, t0));
        assert!(!handler.first_sighting(&call, t0 + Duration::from_secs(10)));
        assert!(handler.first_sighting(&call, t0 + SEEN_WINDOW + Duration::from_secs(1)));
    }
}
