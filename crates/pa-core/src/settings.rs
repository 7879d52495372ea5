//! Settings store collaborator
//!
//! The host application's settings repository, consumed only through
//! `get`/`set`. `InMemorySettings` backs tests and the standalone binary.

use dashmap::DashMap;
use serde_json::Value;

use crate::{Error, Result};

/// Toggle gating the whole private API feature
pub const ENABLE_PRIVATE_API: &str = "enable_private_api";

/// Key/value settings accessor
pub trait SettingsStore: Send + Sync {
    /// Read a setting
    fn get(&self, key: &str) -> Option<Value>;

    /// Write a setting
    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Read a boolean setting; `"true"`/`1` count as true
    fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
            _ => false,
        }
    }
}

/// Settings held in memory
#[derive(Debug, Default)]
pub struct InMemorySettings {
    values: DashMap<String, Value>,
}

impl InMemorySettings {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the private API feature switched on or off
    pub fn with_private_api(enabled: bool) -> Self {
        let store = Self::new();
        store
            .values
            .insert(ENABLE_PRIVATE_API.to_string(), Value::Bool(enabled));
        store
    }
}

impl SettingsStore for InMemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::Settings("setting key must not be empty".to_string()));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}
