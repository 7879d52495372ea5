//! Handle/contact lookup collaborator
//!
//! Used to enrich helper events with the local address of a handle.

use async_trait::async_trait;
use dashmap::DashMap;

/// Resolves a helper-side handle id to a local address (phone or email)
#[async_trait]
pub trait HandleResolver: Send + Sync {
    /// Look up the address for a handle; `None` when unknown
    async fn resolve_address(&self, handle: &str) -> Option<String>;
}

/// Fixed handle table
#[derive(Debug, Default)]
pub struct StaticHandleResolver {
    addresses: DashMap<String, String>,
}

impl StaticHandleResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address for a handle
    pub fn insert(&self, handle: impl Into<String>, address: impl Into<String>) {
        self.addresses.insert(handle.into(), address.into());
    }
}

#[async_trait]
impl HandleResolver for StaticHandleResolver {
    async fn resolve_address(&self, handle: &str) -> Option<String> {
        self.addresses.get(handle).map(|a| a.value().clone())
    }
}
