//! pa-core: shared foundation for the private API bridge
//!
//! Configuration, port derivation, and the collaborator interfaces the
//! bridge calls into (settings, handle lookup, notification dispatch).

pub mod config;
pub mod error;
pub mod handles;
pub mod notify;
pub mod port;
pub mod settings;

pub use config::{BridgeConfig, Config, ModeConfig, ModeKind};
pub use error::{Error, Result};
pub use handles::{HandleResolver, StaticHandleResolver};
pub use notify::{ChannelNotifier, Notification, NotificationPriority, Notifier, TracingNotifier};
pub use port::{derive_port, listen_port};
pub use settings::{InMemorySettings, SettingsStore, ENABLE_PRIVATE_API};
