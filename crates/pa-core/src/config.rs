//! Configuration management
//!
//! Configuration is loaded in the following order of precedence:
//! 1. Environment variables
//! 2. `pa-gateway.toml` configuration file
//! 3. Default values
//!
//! `${VAR_NAME}` inside the configuration file is expanded from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Error;

/// How the helper gets attached to the messaging application
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    /// Relaunch the target app with the helper library injected
    #[default]
    ProcessInjection,
    /// Legacy plugin bundle loaded by an external host application
    Bundle,
}

impl ModeKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "process-injection" | "injection" | "dylib" => Some(ModeKind::ProcessInjection),
            "bundle" | "macforge" | "plugin" => Some(ModeKind::Bundle),
            _ => None,
        }
    }
}

/// Socket broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// First port of the per-user port range (uid 501 maps here).
    /// `0` lets the OS pick a port, which only makes sense in tests.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Upper clamp for the derived port
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Bind address; the helper always connects over loopback
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Listener failures tolerated before the broker gives up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Pause after each write before the next writer may proceed
    #[serde(default = "default_write_delay_ms")]
    pub write_delay_ms: u64,

    /// Longest a single connection may take to accept a line
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Deadline applied to transactional writes
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,

    /// Delay between successive Find My location notifications
    #[serde(default = "default_findmy_emit_delay_ms")]
    pub findmy_emit_delay_ms: u64,

    /// Window during which identical typing states are coalesced
    #[serde(default = "default_typing_debounce_secs")]
    pub typing_debounce_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            max_port: default_max_port(),
            host: default_host(),
            backlog: default_backlog(),
            max_restarts: default_max_restarts(),
            write_delay_ms: default_write_delay_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            findmy_emit_delay_ms: default_findmy_emit_delay_ms(),
            typing_debounce_secs: default_typing_debounce_secs(),
        }
    }
}

/// Attach mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Selected strategy
    #[serde(default)]
    pub kind: ModeKind,

    /// Helper library injected into the target process
    #[serde(default = "default_dylib_path")]
    pub dylib_path: PathBuf,

    /// Executable of the messaging application
    #[serde(default = "default_target_app_path")]
    pub target_app_path: PathBuf,

    /// Wait before relaunching the target after an unexpected exit
    #[serde(default = "default_relaunch_delay_ms")]
    pub relaunch_delay_ms: u64,

    /// Directory holding the versioned plugin bundle
    #[serde(default = "default_bundle_source_dir")]
    pub bundle_source_dir: PathBuf,

    /// Plugin directories the bundle is copied into
    #[serde(default = "default_plugin_dirs")]
    pub plugin_dirs: Vec<PathBuf>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            kind: ModeKind::default(),
            dylib_path: default_dylib_path(),
            target_app_path: default_target_app_path(),
            relaunch_delay_ms: default_relaunch_delay_ms(),
            bundle_source_dir: default_bundle_source_dir(),
            plugin_dirs: default_plugin_dirs(),
        }
    }
}

/// Main configuration for pa-gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Socket broker configuration
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Attach mode configuration
    #[serde(default)]
    pub mode: ModeConfig,
}

fn default_base_port() -> u16 {
    45670
}

fn default_max_port() -> u16 {
    65535
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> u32 {
    511
}

fn default_max_restarts() -> u32 {
    5
}

fn default_write_delay_ms() -> u64 {
    25
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_transaction_timeout_secs() -> u64 {
    120
}

fn default_findmy_emit_delay_ms() -> u64 {
    250
}

fn default_typing_debounce_secs() -> u64 {
    5
}

fn default_dylib_path() -> PathBuf {
    PathBuf::from("resources/private-api/helper.dylib")
}

fn default_target_app_path() -> PathBuf {
    PathBuf::from("/System/Applications/Messages.app/Contents/MacOS/Messages")
}

fn default_relaunch_delay_ms() -> u64 {
    5000
}

fn default_bundle_source_dir() -> PathBuf {
    PathBuf::from("resources/private-api/bundles")
}

fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(
        "/Library/Application Support/MacEnhance/Plugins",
    )];
    if let Ok(home) = std::env::var("HOME") {
        dirs.push(PathBuf::from(home).join("Library/Application Support/MacEnhance/Plugins"));
    }
    dirs
}

impl Config {
    /// Expand `${VAR_NAME}` occurrences from the environment.
    ///
    /// Unknown variables expand to an empty string.
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Load configuration from a TOML file
    ///
    /// Environment variables still take precedence over file values.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)?;

        let mut cfg = Self::from_toml_str(&toml_content)?;
        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse configuration from TOML text (after `${VAR}` expansion)
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        let config: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        Self::from_toml_config(config)
    }

    /// Load from the default path
    ///
    /// Looks for `./pa-gateway.toml`, otherwise falls back to environment only.
    pub fn load() -> crate::Result<Self> {
        if Path::new("pa-gateway.toml").exists() {
            return Self::from_toml_file("pa-gateway.toml");
        }

        let cfg = Self::from_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check values that cannot be expressed by their types alone
    pub fn validate(&self) -> crate::Result<()> {
        if self.bridge.max_port < self.bridge.base_port {
            return Err(Error::Config(format!(
                "bridge.max_port ({}) is below bridge.base_port ({})",
                self.bridge.max_port, self.bridge.base_port
            )));
        }
        if self.bridge.write_timeout_ms == 0 {
            return Err(Error::Config(
                "bridge.write_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from environment variables over defaults
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn from_toml_config(toml: TomlConfig) -> crate::Result<Self> {
        let bridge = toml.bridge.unwrap_or_default();
        let defaults = BridgeConfig::default();
        let bridge_config = BridgeConfig {
            base_port: bridge.base_port.unwrap_or(defaults.base_port),
            max_port: bridge.max_port.unwrap_or(defaults.max_port),
            host: bridge.host.unwrap_or(defaults.host),
            backlog: bridge.backlog.unwrap_or(defaults.backlog),
            max_restarts: bridge.max_restarts.unwrap_or(defaults.max_restarts),
            write_delay_ms: bridge.write_delay_ms.unwrap_or(defaults.write_delay_ms),
            write_timeout_ms: bridge.write_timeout_ms.unwrap_or(defaults.write_timeout_ms),
            transaction_timeout_secs: bridge
                .transaction_timeout_secs
                .unwrap_or(defaults.transaction_timeout_secs),
            findmy_emit_delay_ms: bridge
                .findmy_emit_delay_ms
                .unwrap_or(defaults.findmy_emit_delay_ms),
            typing_debounce_secs: bridge
                .typing_debounce_secs
                .unwrap_or(defaults.typing_debounce_secs),
        };

        let mode = toml.mode.unwrap_or_default();
        let kind = match mode.kind {
            Some(kind) => ModeKind::parse(&kind)
                .ok_or_else(|| Error::Config(format!("Unknown mode kind: {}", kind)))?,
            None => ModeKind::default(),
        };
        let mode_defaults = ModeConfig::default();
        let mode_config = ModeConfig {
            kind,
            dylib_path: mode.dylib_path.unwrap_or(mode_defaults.dylib_path),
            target_app_path: mode.target_app_path.unwrap_or(mode_defaults.target_app_path),
            relaunch_delay_ms: mode
                .relaunch_delay_ms
                .unwrap_or(mode_defaults.relaunch_delay_ms),
            bundle_source_dir: mode
                .bundle_source_dir
                .unwrap_or(mode_defaults.bundle_source_dir),
            plugin_dirs: mode.plugin_dirs.unwrap_or(mode_defaults.plugin_dirs),
        };

        let config = Config {
            bridge: bridge_config,
            mode: mode_config,
        };
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse("PA_BASE_PORT") {
            self.bridge.base_port = port;
        }
        if let Ok(host) = std::env::var("PA_HOST") {
            if !host.is_empty() {
                self.bridge.host = host;
            }
        }
        if let Some(max) = env_parse("PA_MAX_RESTARTS") {
            self.bridge.max_restarts = max;
        }
        if let Some(delay) = env_parse("PA_WRITE_DELAY_MS") {
            self.bridge.write_delay_ms = delay;
        }
        if let Some(timeout) = env_parse("PA_WRITE_TIMEOUT_MS") {
            self.bridge.write_timeout_ms = timeout;
        }
        if let Some(timeout) = env_parse("PA_TRANSACTION_TIMEOUT_SECS") {
            self.bridge.transaction_timeout_secs = timeout;
        }

        if let Ok(mode) = std::env::var("PA_MODE") {
            match ModeKind::parse(&mode) {
                Some(kind) => self.mode.kind = kind,
                None => tracing::warn!("Ignoring unknown PA_MODE value: {}", mode),
            }
        }
        if let Ok(path) = std::env::var("PA_DYLIB_PATH") {
            self.mode.dylib_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PA_TARGET_APP") {
            self.mode.target_app_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PA_BUNDLE_SOURCE") {
            self.mode.bundle_source_dir = PathBuf::from(path);
        }
        if let Ok(dirs) = std::env::var("PA_PLUGIN_DIRS") {
            self.mode.plugin_dirs = dirs
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// TOML file structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    bridge: Option<TomlBridgeConfig>,
    mode: Option<TomlModeConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlBridgeConfig {
    base_port: Option<u16>,
    max_port: Option<u16>,
    host: Option<String>,
    backlog: Option<u32>,
    max_restarts: Option<u32>,
    write_delay_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    transaction_timeout_secs: Option<u64>,
    findmy_emit_delay_ms: Option<u64>,
    typing_debounce_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlModeConfig {
    kind: Option<String>,
    dylib_path: Option<PathBuf>,
    target_app_path: Option<PathBuf>,
    relaunch_delay_ms: Option<u64>,
    bundle_source_dir: Option<PathBuf>,
    plugin_dirs: Option<Vec<PathBuf>>,
}
