//! Find My friends location handler

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use pa_core::{Notification, Notifier};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{EventHandler, HelperEvent, IncomingEvent, notifications, types};
use crate::connection::ConnectionInfo;
use crate::error::Result;

/// A single friend's reported location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindMyLocation {
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// `[latitude, longitude]`
    #[serde(default)]
    pub coordinates: [f64; 2],
    /// Epoch milliseconds of the fix
    #[serde(default)]
    pub last_updated: Option<i64>,
    #[serde(default)]
    pub long_address: Option<String>,
    #[serde(default)]
    pub short_address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FindMyLocation {
    /// Cache key: the handle, falling back to the helper's id
    pub fn key(&self) -> Option<&str> {
        self.handle
            .as_deref()
            .or(self.id.as_deref())
            .filter(|k| !k.is_empty())
    }
}

/// Last known location per friend
#[derive(Debug, Default)]
pub struct FindMyLocationCache {
    locations: DashMap<String, FindMyLocation>,
}

impl FindMyLocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch into the cache and return the entries that changed
    ///
    /// An update older than the cached fix is ignored, as is one identical
    /// to it. Entries without a handle or id are dropped.
    pub fn add_all(&self, updates: Vec<FindMyLocation>) -> Vec<FindMyLocation> {
        let mut changed = Vec::new();
        for update in updates {
            let Some(key) = update.key().map(str::to_string) else {
                debug!("Dropping Find My location without a handle");
                continue;
            };

            let is_change = match self.locations.get(&key) {
                Some(existing) => {
                    let older = matches!(
                        (update.last_updated, existing.last_updated),
                        (Some(new), Some(old)) if new < old
                    );
                    !older && *existing != update
                }
                None => true,
            };

            if is_change {
                self.locations.insert(key, update.clone());
                changed.push(update);
            }
        }
        changed
    }

    pub fn get(&self, key: &str) -> Option<FindMyLocation> {
        self.locations.get(key).map(|l| l.value().clone())
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Publishes changed friend locations one at a time
pub struct FindMyLocationHandler {
    notifier: Arc<dyn Notifier>,
    cache: Arc<FindMyLocationCache>,
    delay: Duration,
    // Keeps batches from interleaving their emissions
    emitting: Arc<Mutex<()>>,
}

impl FindMyLocationHandler {
    pub fn new(notifier: Arc<dyn Notifier>, cache: Arc<FindMyLocationCache>, delay: Duration) -> Self {
        Self {
            notifier,
            cache,
            delay,
            emitting: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl EventHandler for FindMyLocationHandler {
    fn name(&self) -> &'static str {
        "findmy-location"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[types::FINDMY_LOCATION]
    }

    async fn handle(&self, event: &IncomingEvent, _connection: &ConnectionInfo) -> Result<()> {
        let HelperEvent::FindMyLocations(locations) = &event.kind else {
            warn!("Unusable Find My location payload");
            return Ok(());
        };

        let changed = self.cache.add_all(locations.clone());
        debug!(
            "Find My batch of {} produced {} change(s)",
            locations.len(),
            changed.len()
        );
        if changed.is_empty() {
            return Ok(());
        }

        let notifier = self.notifier.clone();
        let emitting = self.emitting.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            let _guard = emitting.lock().await;
            for (i, location) in changed.into_iter().enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match serde_json::to_value(&location) {
                    Ok(payload) => notifier.notify(Notification::new(
                        notifications::FINDMY_LOCATION,
                        payload,
                    )),
                    Err(e) => warn!("Failed to encode Find My location: {}", e),
                }
            }
        });
        Ok(())
    }
}
