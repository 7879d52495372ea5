//! pa-gateway: Private API bridge binary
//!
//! Runs the helper broker standalone.
//!
//! Usage:
//!   pa-gateway              - Start the broker and attach the helper
//!   pa-gateway --uninstall  - Remove installed helper artifacts
//!   pa-gateway --help       - Show help

use std::sync::Arc;

use pa_bridge::mode;
use pa_bridge::{Collaborators, PrivateApiBroker};
use pa_core::{ChannelNotifier, Config, InMemorySettings, SettingsStore, StaticHandleResolver};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Run mode
#[derive(Debug, PartialEq, Eq)]
enum RunMode {
    /// Run the broker until Ctrl+C
    Serve,
    /// Remove installed helper artifacts
    Uninstall,
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args(std::env::args().skip(1));

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("pa-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;
    let settings: Arc<dyn SettingsStore> = Arc::new(InMemorySettings::with_private_api(
        private_api_enabled(std::env::var("PA_ENABLE_PRIVATE_API").ok().as_deref()),
    ));
    let attach = mode::build(config.mode.kind, &config.mode, settings);

    match mode {
        RunMode::Uninstall => {
            let status = attach.uninstall().await?;
            tracing::info!("{} uninstall: {}", attach.name(), status.message);
            Ok(())
        }
        _ => run(config, attach).await,
    }
}

/// Parse command line arguments
fn parse_args(args: impl IntoIterator<Item = String>) -> RunMode {
    for arg in args {
        match arg.as_str() {
            "--uninstall" | "-u" => return RunMode::Uninstall,
            "--help" | "-h" => return RunMode::Help,
            "--version" | "-v" => return RunMode::Version,
            _ => {}
        }
    }

    RunMode::Serve
}

/// Feature toggle from the environment; on unless explicitly disabled
fn private_api_enabled(value: Option<&str>) -> bool {
    !matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("false" | "0" | "no" | "off")
    )
}

/// Print help message
fn print_help() {
    println!("pa-gateway - Private API helper bridge");
    println!();
    println!("Usage:");
    println!("  pa-gateway              Start the broker and attach the helper");
    println!("  pa-gateway --uninstall  Remove installed helper artifacts");
    println!("  pa-gateway --help       Show this help message");
    println!("  pa-gateway --version    Show version");
    println!();
    println!("Configuration is read from pa-gateway.toml when present.");
    println!();
    println!("Environment Variables:");
    println!("  PA_BASE_PORT                 First port of the per-user range (default: 45670)");
    println!("  PA_HOST                      Listen address (default: 127.0.0.1)");
    println!("  PA_MAX_RESTARTS              Listener restarts before giving up (default: 5)");
    println!("  PA_WRITE_DELAY_MS            Pause after each write (default: 25)");
    println!("  PA_WRITE_TIMEOUT_MS          Per-connection write limit (default: 5000)");
    println!("  PA_TRANSACTION_TIMEOUT_SECS  Response deadline (default: 120)");
    println!("  PA_MODE                      process-injection or bundle");
    println!("  PA_DYLIB_PATH                Helper library to inject");
    println!("  PA_TARGET_APP                Messaging app executable");
    println!("  PA_BUNDLE_SOURCE             Directory holding plugin bundles");
    println!("  PA_PLUGIN_DIRS               Plugin directories, comma separated");
    println!("  PA_ENABLE_PRIVATE_API        Set to false to skip attaching the helper");
}

/// Run the broker until Ctrl+C
async fn run(config: Config, attach: Arc<dyn mode::AttachMode>) -> anyhow::Result<()> {
    let notifier = Arc::new(ChannelNotifier::new(256));
    let mut notifications = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) => tracing::info!(
                    "[{:?}] {}: {}",
                    n.priority,
                    n.event,
                    serde_json::to_string(&n.payload).unwrap_or_default()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} notifications", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let broker = PrivateApiBroker::new(
        config.bridge.clone(),
        Collaborators {
            notifier,
            resolver: Arc::new(StaticHandleResolver::new()),
        },
        Some(attach),
    );

    tracing::info!("Starting pa-gateway...");
    broker.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    broker.stop().await?;
    Ok(())
}
