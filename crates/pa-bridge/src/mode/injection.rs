//! Process injection mode
//!
//! Relaunches the messaging application with the helper library inserted
//! through `DYLD_INSERT_LIBRARIES` and keeps it running: a supervisor task
//! waits on the child and relaunches it after an unexpected exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pa_core::{ENABLE_PRIVATE_API, ModeConfig, SettingsStore};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AppControl, AttachMode, InstallStatus};
use crate::error::{BridgeError, Result};

struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ProcessInjectionMode {
    config: ModeConfig,
    settings: Arc<dyn SettingsStore>,
    supervisor: Mutex<Option<Supervisor>>,
    launches: Arc<AtomicUsize>,
}

impl ProcessInjectionMode {
    pub fn new(config: ModeConfig, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            config,
            settings,
            supervisor: Mutex::new(None),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of times the target has been launched
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub async fn is_supervising(&self) -> bool {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}

fn spawn_target(target: &Path, dylib: &Path) -> std::io::Result<Child> {
    Command::new(target)
        .env("DYLD_INSERT_LIBRARIES", dylib)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn supervise(
    target: PathBuf,
    dylib: PathBuf,
    relaunch_delay: Duration,
    launches: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match spawn_target(&target, &dylib) {
            Ok(mut child) => {
                launches.fetch_add(1, Ordering::SeqCst);
                info!(
                    "Launched {} with helper injected (pid {:?})",
                    target.display(),
                    child.id()
                );

                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => warn!("{} exited unexpectedly ({})", target.display(), status),
                        Err(e) => error!("Failed waiting on {}: {}", target.display(), e),
                    },
                    _ = shutdown.changed() => {
                        if let Err(e) = child.kill().await {
                            debug!("Kill of {} failed: {}", target.display(), e);
                        }
                        return;
                    }
                }
            }
            Err(e) => error!("Failed to launch {}: {}", target.display(), e),
        }

        tokio::select! {
            _ = tokio::time::sleep(relaunch_delay) => {
                info!("Relaunching {}", target.display());
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[async_trait]
impl AttachMode for ProcessInjectionMode {
    fn name(&self) -> &'static str {
        "process-injection"
    }

    async fn install(&self) -> Result<InstallStatus> {
        if !self.settings.get_bool(ENABLE_PRIVATE_API) {
            return Ok(InstallStatus::failed("Private API feature is disabled"));
        }
        if !self.config.dylib_path.exists() {
            return Ok(InstallStatus::failed(format!(
                "Helper library not found at {}",
                self.config.dylib_path.display()
            )));
        }
        Ok(InstallStatus::ok("Helper library is in place"))
    }

    async fn uninstall(&self) -> Result<InstallStatus> {
        // Nothing is copied anywhere; the library ships with the server
        Ok(InstallStatus::ok("Nothing to uninstall for process injection"))
    }

    async fn start(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            debug!("Injection supervisor already running");
            return Ok(());
        }

        if !self.config.dylib_path.exists() {
            return Err(BridgeError::Mode(format!(
                "helper library not found at {}",
                self.config.dylib_path.display()
            )));
        }

        if let Some(app) = AppControl::app_name(&self.config.target_app_path) {
            if let Err(e) = AppControl::quit(&app).await {
                warn!("Could not quit running {}: {}", app, e);
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(
            self.config.target_app_path.clone(),
            self.config.dylib_path.clone(),
            Duration::from_millis(self.config.relaunch_delay_ms),
            self.launches.clone(),
            rx,
        ));
        *supervisor = Some(Supervisor { shutdown, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(Supervisor { shutdown, handle }) = self.supervisor.lock().await.take() else {
            return Ok(());
        };

        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            warn!("Injection supervisor ended abnormally: {}", e);
        }
        info!("Stopped {}", self.config.target_app_path.display());
        Ok(())
    }
}
