//! FaceTime call session tracking
//!
//! Calls answered or linked through the bridge are tracked here until the
//! helper reports them disconnected.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

/// A call the bridge is participating in
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub call_uuid: String,
    /// Shareable link, once generated
    pub link: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// In-memory FaceTime session store
#[derive(Debug, Default)]
pub struct FaceTimeSessions {
    sessions: DashMap<String, CallSession>,
}

impl FaceTimeSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a call, keeping any existing link
    pub fn track(&self, call_uuid: &str) {
        self.sessions
            .entry(call_uuid.to_string())
            .or_insert_with(|| CallSession {
                call_uuid: call_uuid.to_string(),
                link: None,
                started_at: Utc::now(),
            });
        debug!("Tracking FaceTime call {}", call_uuid);
    }

    /// Attach a generated link to a tracked call
    pub fn set_link(&self, call_uuid: &str, link: &str) {
        self.track(call_uuid);
        if let Some(mut session) = self.sessions.get_mut(call_uuid) {
            session.link = Some(link.to_string());
        }
    }

    pub fn get(&self, call_uuid: &str) -> Option<CallSession> {
        self.sessions.get(call_uuid).map(|s| s.value().clone())
    }

    /// Stop tracking a call; returns whether it was tracked
    pub fn invalidate(&self, call_uuid: &str) -> bool {
        let removed = self.sessions.remove(call_uuid).is_some();
        if removed {
            debug!("Invalidated FaceTime call {}", call_uuid);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_invalidate() {
        let sessions = FaceTimeSessions::new();
        sessions.track("call-1");
        sessions.track("call-1");
        assert_eq!(sessions.len(), 1);

        assert!(sessions.invalidate("call-1"));
        assert!(!sessions.invalidate("call-1"));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_set_link() {
        let sessions = FaceTimeSessions::new();
        sessions.set_link("call-2", "https://facetime.apple.com/join#v=1");
        assert_eq!(
            sessions.get("call-2").and_then(|s| s.link).as_deref(),
            Some("https://facetime.apple.com/join#v=1")
        );
    }
}
