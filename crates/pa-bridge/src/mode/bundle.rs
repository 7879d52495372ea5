//! Plugin bundle mode
//!
//! Copies versioned `.bundle` directories into the plugin directories of
//! an external host application, which loads them into the messaging app.
//! Lifecycle belongs to that host, so start/stop do nothing here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use pa_core::{ENABLE_PRIVATE_API, ModeConfig, SettingsStore};
use regex::Regex;
use semver::Version;
use tracing::{debug, info, warn};

use super::{AttachMode, InstallStatus};
use crate::error::{BridgeError, Result};

pub struct BundleMode {
    config: ModeConfig,
    settings: Arc<dyn SettingsStore>,
}

impl BundleMode {
    pub fn new(config: ModeConfig, settings: Arc<dyn SettingsStore>) -> Self {
        Self { config, settings }
    }
}

fn version_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<key>CFBundleShortVersionString</key>\s*<string>([^<]+)</string>").ok()
    })
    .as_ref()
}

/// Parse a bundle version, padding `1.2` to `1.2.0`
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let mut parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

/// Version declared in a bundle's `Contents/Info.plist`
pub fn bundle_version(bundle: &Path) -> Option<Version> {
    let plist = fs::read_to_string(bundle.join("Contents").join("Info.plist")).ok()?;
    let captures = version_regex()?.captures(&plist)?;
    parse_version(&captures[1])
}

fn source_bundles(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut bundles = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && path.extension().is_some_and(|ext| ext == "bundle") {
            bundles.push(path);
        }
    }
    bundles.sort();
    Ok(bundles)
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Whether `dest` already holds an equal or newer copy of `src`
fn up_to_date(src: &Path, dest: &Path) -> bool {
    if !dest.exists() {
        return false;
    }
    match (bundle_version(src), bundle_version(dest)) {
        (Some(source), Some(installed)) => installed >= source,
        _ => false,
    }
}

fn install_bundles(source_dir: &Path, plugin_dirs: &[PathBuf]) -> io::Result<InstallStatus> {
    if !source_dir.is_dir() {
        return Ok(InstallStatus::failed(format!(
            "Bundle directory not found at {}",
            source_dir.display()
        )));
    }
    let bundles = source_bundles(source_dir)?;
    if bundles.is_empty() {
        return Ok(InstallStatus::failed(format!(
            "No plugin bundles in {}",
            source_dir.display()
        )));
    }

    let mut copied = 0;
    let mut current = 0;
    for plugin_dir in plugin_dirs {
        if let Err(e) = fs::create_dir_all(plugin_dir) {
            warn!("Skipping plugin directory {}: {}", plugin_dir.display(), e);
            continue;
        }
        for bundle in &bundles {
            let Some(name) = bundle.file_name() else {
                continue;
            };
            let dest = plugin_dir.join(name);
            if up_to_date(bundle, &dest) {
                debug!("{} is up to date", dest.display());
                current += 1;
                continue;
            }
            if dest.exists() {
                fs::remove_dir_all(&dest)?;
            }
            copy_dir(bundle, &dest)?;
            info!("Installed {}", dest.display());
            copied += 1;
        }
    }

    if copied == 0 && current == 0 {
        return Ok(InstallStatus::failed("No plugin directory was writable"));
    }
    Ok(InstallStatus::ok(format!(
        "Installed {} bundle(s), {} already up to date",
        copied, current
    )))
}

fn uninstall_bundles(source_dir: &Path, plugin_dirs: &[PathBuf]) -> io::Result<InstallStatus> {
    let bundles = if source_dir.is_dir() {
        source_bundles(source_dir)?
    } else {
        Vec::new()
    };

    let mut removed = 0;
    for plugin_dir in plugin_dirs {
        for bundle in &bundles {
            let Some(name) = bundle.file_name() else {
                continue;
            };
            let dest = plugin_dir.join(name);
            if dest.exists() {
                fs::remove_dir_all(&dest)?;
                info!("Removed {}", dest.display());
                removed += 1;
            }
        }
    }
    Ok(InstallStatus::ok(format!("Removed {} bundle(s)", removed)))
}

#[async_trait]
impl AttachMode for BundleMode {
    fn name(&self) -> &'static str {
        "bundle"
    }

    async fn install(&self) -> Result<InstallStatus> {
        if !self.settings.get_bool(ENABLE_PRIVATE_API) {
            return Ok(InstallStatus::failed("Private API feature is disabled"));
        }

        let source = self.config.bundle_source_dir.clone();
        let dirs = self.config.plugin_dirs.clone();
        let status = tokio::task::spawn_blocking(move || install_bundles(&source, &dirs))
            .await
            .map_err(|e| BridgeError::Mode(format!("bundle install task failed: {}", e)))??;
        Ok(status)
    }

    async fn uninstall(&self) -> Result<InstallStatus> {
        let source = self.config.bundle_source_dir.clone();
        let dirs = self.config.plugin_dirs.clone();
        let status = tokio::task::spawn_blocking(move || uninstall_bundles(&source, &dirs))
            .await
            .map_err(|e| BridgeError::Mode(format!("bundle uninstall task failed: {}", e)))??;
        Ok(status)
    }

    async fn start(&self) -> Result<()> {
        debug!("Bundle mode: helper lifecycle is managed by the host application");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_core::InMemorySettings;
    use tempfile::TempDir;

    const NAME: &str = "Helper.bundle";

    fn write_bundle(root: &Path, version: &str, marker: &str) {
        let contents = root.join(NAME).join("Contents");
        fs::create_dir_all(contents.join("MacOS")).unwrap();
        fs::write(
            contents.join("Info.plist"),
            format!(
                "<plist><dict>\n<key>CFBundleShortVersionString</key>\n\t<string>{}</string>\n</dict></plist>",
                version
            ),
        )
        .unwrap();
        fs::write(contents.join("MacOS").join("Helper"), marker).unwrap();
    }

    fn installed_marker(plugins: &Path) -> String {
        fs::read_to_string(plugins.join(NAME).join("Contents/MacOS/Helper")).unwrap()
    }

    fn mode(source: &Path, plugins: &Path) -> BundleMode {
        BundleMode::new(
            ModeConfig {
                bundle_source_dir: source.to_path_buf(),
                plugin_dirs: vec![plugins.to_path_buf()],
                ..ModeConfig::default()
            },
            Arc::new(InMemorySettings::with_private_api(true)),
        )
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("2"), Some(Version::new(2, 0, 0)));
        assert_eq!(parse_version("1.0.3"), Some(Version::new(1, 0, 3)));
        assert!(parse_version("abc").is_none());
    }

    #[tokio::test]
    async fn test_install_copies_bundle() {
        let source = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_bundle(source.path(), "1.0", "v1");

        let status = mode(source.path(), plugins.path()).install().await.unwrap();

        assert!(status.success);
        assert_eq!(installed_marker(plugins.path()), "v1");
        assert_eq!(
            bundle_version(&plugins.path().join(NAME)),
            Some(Version::new(1, 0, 0))
        );
    }

    #[tokio::test]
    async fn test_install_skips_equal_or_newer() {
        let source = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_bundle(source.path(), "1.0", "source");
        write_bundle(plugins.path(), "1.2", "installed");

        let status = mode(source.path(), plugins.path()).install().await.unwrap();
        assert!(status.success);
        assert_eq!(installed_marker(plugins.path()), "installed");

        write_bundle(plugins.path(), "1.0", "installed-same");
        mode(source.path(), plugins.path()).install().await.unwrap();
        assert_eq!(installed_marker(plugins.path()), "installed-same");
    }

    #[tokio::test]
    async fn test_install_replaces_older() {
        let source = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_bundle(source.path(), "2.0.1", "new");
        write_bundle(plugins.path(), "2.0.0", "old");

        mode(source.path(), plugins.path()).install().await.unwrap();
        assert_eq!(installed_marker(plugins.path()), "new");
    }

    #[tokio::test]
    async fn test_install_missing_source() {
        let plugins = TempDir::new().unwrap();
        let status = mode(Path::new("/nonexistent/bundles"), plugins.path())
            .install()
            .await
            .unwrap();
        assert!(!status.success);
    }

    #[tokio::test]
    async fn test_install_disabled() {
        let source = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_bundle(source.path(), "1.0", "v1");
        let mode = BundleMode::new(
            ModeConfig {
                bundle_source_dir: source.path().to_path_buf(),
                plugin_dirs: vec![plugins.path().to_path_buf()],
                ..ModeConfig::default()
            },
            Arc::new(InMemorySettings::with_private_api(false)),
        );

        assert!(!mode.install().await.unwrap().success);
        assert!(!plugins.path().join(NAME).exists());
    }

    #[tokio::test]
    async fn test_uninstall_removes_bundle() {
        let source = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_bundle(source.path(), "1.0", "v1");
        let mode = mode(source.path(), plugins.path());

        mode.install().await.unwrap();
        let status = mode.uninstall().await.unwrap();

        assert!(status.success);
        assert!(!plugins.path().join(NAME).exists());
    }
}
