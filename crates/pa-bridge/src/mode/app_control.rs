//! Target application control through AppleScript

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{BridgeError, Result};

/// Controls a macOS application by name via `osascript`
pub struct AppControl;

impl AppControl {
    async fn execute(script: &str) -> Result<String> {
        debug!("Executing AppleScript: {}", script.trim().lines().next().unwrap_or(""));

        let output = Command::new("osascript")
            .arg("-e")
            .arg(script)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("AppleScript failed: {}", stderr.trim());
            return Err(BridgeError::Mode(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Application name for an executable inside an `.app` bundle
    ///
    /// `/System/Applications/Messages.app/Contents/MacOS/Messages` gives
    /// `Messages`; paths outside a bundle give `None`.
    pub fn app_name(executable: &Path) -> Option<String> {
        executable
            .ancestors()
            .filter_map(|p| p.file_name()?.to_str())
            .find_map(|name| name.strip_suffix(".app"))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    pub async fn is_running(app: &str) -> Result<bool> {
        let script = format!(
            r#"tell application "System Events" to return (name of processes) contains "{}""#,
            Self::escape(app)
        );
        Ok(Self::execute(&script).await? == "true")
    }

    /// Ask the application to quit if it is running
    pub async fn quit(app: &str) -> Result<()> {
        if !Self::is_running(app).await? {
            return Ok(());
        }
        let script = format!(r#"tell application "{}" to quit"#, Self::escape(app));
        Self::execute(&script).await?;
        debug!("Asked {} to quit", app);
        Ok(())
    }

    fn escape(s: &str) -> String {
        s.replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_name() {
        assert_eq!(
            AppControl::app_name(Path::new(
                "/System/Applications/Messages.app/Contents/MacOS/Messages"
            ))
            .as_deref(),
            Some("Messages")
        );
        assert_eq!(
            AppControl::app_name(Path::new("/Applications/FaceTime.app")).as_deref(),
            Some("FaceTime")
        );
        assert!(AppControl::app_name(Path::new("/bin/sh")).is_none());
    }

    #[test]
    fn test_escape() {
        assert_eq!(AppControl::escape(r#"My "App""#), r#"My \"App\""#);
        assert_eq!(AppControl::escape("a\\b"), "a\\\\b");
    }
}
