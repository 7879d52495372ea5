//! Attach modes
//!
//! How the helper gets into the messaging application. The broker only
//! sees the `AttachMode` trait; the concrete strategy is picked from
//! configuration at startup.

pub mod app_control;
pub mod bundle;
pub mod injection;

use std::sync::Arc;

use async_trait::async_trait;
use pa_core::{ModeConfig, ModeKind, SettingsStore};

use crate::error::Result;

pub use app_control::AppControl;
pub use bundle::BundleMode;
pub use injection::ProcessInjectionMode;

/// Outcome of an install/uninstall that may legitimately not happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStatus {
    pub success: bool,
    pub message: String,
}

impl InstallStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Strategy attaching the helper to its host process
#[async_trait]
pub trait AttachMode: Send + Sync {
    fn name(&self) -> &'static str;

    /// Put the helper artifacts in place
    async fn install(&self) -> Result<InstallStatus>;

    /// Remove installed helper artifacts
    async fn uninstall(&self) -> Result<InstallStatus>;

    /// Begin attaching; must not block for the target's lifetime
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Select the attach mode for a configured kind
pub fn build(
    kind: ModeKind,
    config: &ModeConfig,
    settings: Arc<dyn SettingsStore>,
) -> Arc<dyn AttachMode> {
    match kind {
        ModeKind::ProcessInjection => Arc::new(ProcessInjectionMode::new(config.clone(), settings)),
        ModeKind::Bundle => Arc::new(BundleMode::new(config.clone(), settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_core::InMemorySettings;

    #[test]
    fn test_build_selects_strategy() {
        let settings: Arc<dyn SettingsStore> = Arc::new(InMemorySettings::new());
        let config = ModeConfig::default();

        assert_eq!(
            build(ModeKind::ProcessInjection, &config, settings.clone()).name(),
            "process-injection"
        );
        assert_eq!(build(ModeKind::Bundle, &config, settings).name(), "bundle");
    }
}
