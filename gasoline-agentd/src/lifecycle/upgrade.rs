use crate::state::create_private_dir;
use crate::telemetry::JsonlLog;
use anyhow::Context;
use chrono::{DateTime, Utc};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const NO_AUTO_UPGRADE_ENV: &str = "GASOLINE_NO_AUTO_UPGRADE";
pub const UPGRADE_GRACE: Duration = Duration::from_secs(5);
const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEBOUNCE: Duration = Duration::from_millis(200);

pub fn auto_upgrade_disabled() -> bool {
    std::env::var(NO_AUTO_UPGRADE_ENV).map_or(false, |value| value.trim() == "1")
}

/// Left behind by a daemon that stepped down for a newer binary; the next
/// daemon reports it once through `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeMarker {
    pub from_version: String,
    pub to_version: String,
    pub at: DateTime<Utc>,
}

impl UpgradeMarker {
    pub fn new(from_version: impl Into<String>, to_version: impl Into<String>) -> Self {
        Self {
            from_version: from_version.into(),
            to_version: to_version.into(),
            at: Utc::now(),
        }
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        let mut options = fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp)
            .with_context(|| format!("failed to open {}", tmp.display()))?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move upgrade marker to {}", path.display()))?;
        Ok(())
    }

    /// Reads and removes the marker. A corrupt marker is discarded.
    pub fn take(path: &Path) -> Option<Self> {
        let raw = fs::read(path).ok()?;
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), %err, "failed to clear upgrade marker");
        }
        match serde_json::from_slice(&raw) {
            Ok(marker) => Some(marker),
            Err(err) => {
                warn!(%err, "discarding unreadable upgrade marker");
                None
            }
        }
    }
}

/// Pulls the version out of `--version` output such as `gasoline 0.7.5`.
pub fn parse_version_output(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| token.split('.').count() >= 2 && token.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
}

fn numeric_parts(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split(['.', '-', '+'])
        .map_while(|part| part.parse::<u64>().ok())
        .collect()
}

/// Compares dotted numeric versions; pre-release suffixes are ignored.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    let candidate = numeric_parts(candidate);
    let current = numeric_parts(current);
    let width = candidate.len().max(current.len());
    for index in 0..width {
        let left = candidate.get(index).copied().unwrap_or(0);
        let right = current.get(index).copied().unwrap_or(0);
        if left != right {
            return left > right;
        }
    }
    false
}

pub async fn query_binary_version(exe: &Path) -> Option<String> {
    let mut command = Command::new(exe);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let output = match tokio::time::timeout(VERSION_QUERY_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            debug!(status = ?output.status, "version query exited with failure");
            return None;
        }
        Ok(Err(err)) => {
            debug!(%err, exe = %exe.display(), "version query failed to run");
            return None;
        }
        Err(_) => {
            debug!(exe = %exe.display(), "version query timed out");
            return None;
        }
    };
    parse_version_output(&String::from_utf8_lossy(&output.stdout))
}

pub struct UpgradeWatchConfig {
    pub exe: PathBuf,
    pub current_version: String,
    pub marker_path: PathBuf,
    pub grace: Duration,
}

/// Keeps the filesystem watcher thread and the reaction task alive.
pub struct UpgradeWatchGuard {
    stop_tx: std::sync::mpsc::Sender<()>,
    watcher_handle: Option<thread::JoinHandle<()>>,
    update_task: tokio::task::JoinHandle<()>,
}

impl UpgradeWatchGuard {
    pub async fn shutdown(self) {
        let UpgradeWatchGuard {
            stop_tx,
            watcher_handle,
            update_task,
        } = self;
        let _ = stop_tx.send(());
        if let Some(handle) = watcher_handle {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }
        update_task.abort();
        let _ = update_task.await;
    }
}

/// Watches the executable's directory. When the binary is replaced by a newer
/// version, writes the upgrade marker and, after the grace period, asks the
/// daemon to shut down so the next bridge starts the new binary.
pub fn spawn_upgrade_watcher(
    config: UpgradeWatchConfig,
    lifecycle: Arc<JsonlLog>,
    shutdown_tx: broadcast::Sender<()>,
) -> anyhow::Result<UpgradeWatchGuard> {
    let dir = config
        .exe
        .parent()
        .map(Path::to_path_buf)
        .context("executable has no parent directory")?;
    let watched_name: OsString = config
        .exe
        .file_name()
        .map(|name| name.to_os_string())
        .context("executable has no file name")?;

    let (event_tx, mut event_rx) = mpsc::channel::<()>(16);
    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    let watch_dir = dir.clone();
    let watcher_handle = thread::spawn(move || {
        let mut watcher = match RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|path| path.file_name() == Some(watched_name.as_os_str()));
                    if relevant {
                        let _ = event_tx.try_send(());
                    }
                }
                Err(err) => {
                    error!(%err, "binary watcher error");
                }
            },
            notify::Config::default(),
        ) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(%err, "failed to initialize binary watcher");
                return;
            }
        };
        if let Err(err) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            error!(directory = %watch_dir.display(), %err, "failed to watch binary directory");
            return;
        }
        let _ = stop_rx.recv();
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    let update_task = tokio::spawn(async move {
        let mut last_check = Instant::now() - DEBOUNCE;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                event = event_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
            let elapsed = last_check.elapsed();
            if elapsed < DEBOUNCE {
                tokio::time::sleep(DEBOUNCE - elapsed).await;
            }
            while event_rx.try_recv().is_ok() {}
            last_check = Instant::now();

            let Some(found) = query_binary_version(&config.exe).await else {
                continue;
            };
            if !is_newer(&found, &config.current_version) {
                debug!(found = %found, "binary changed without a newer version");
                continue;
            }
            info!(from = %config.current_version, to = %found, "newer gasoline binary detected");
            let marker = UpgradeMarker::new(config.current_version.clone(), found.clone());
            if let Err(err) = marker.write(&config.marker_path) {
                warn!(%err, "failed to write upgrade marker");
            }
            lifecycle.record(
                "binary_upgrade_detected",
                json!({
                    "from_version": config.current_version,
                    "to_version": found,
                    "grace_ms": config.grace.as_millis() as u64,
                }),
            );
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = tokio::time::sleep(config.grace) => {
                    let _ = shutdown_tx.send(());
                }
            }
            break;
        }
    });

    info!(directory = %dir.display(), "watching executable for upgrades");
    Ok(UpgradeWatchGuard {
        stop_tx,
        watcher_handle: Some(watcher_handle),
        update_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePaths;
    use tempfile::TempDir;

    #[test]
    fn version_comparison() {
        assert!(is_newer("0.7.5", "0.7.4"));
        assert!(is_newer("v1.0", "0.9.9"));
        assert!(is_newer("0.10.0", "0.9.0"));
        assert!(!is_newer("0.7.4", "0.7.4"));
        assert!(!is_newer("0.7.3", "0.7.4"));
        assert!(!is_newer("0.7.4-beta", "0.7.4"));
    }

    #[test]
    fn parses_version_output() {
        assert_eq!(parse_version_output("gasoline 0.7.5\n").as_deref(), Some("0.7.5"));
        assert_eq!(parse_version_output("gasoline v1.2.0").as_deref(), Some("1.2.0"));
        assert_eq!(parse_version_output("no version here"), None);
    }

    #[test]
    fn marker_is_single_shot() {
        let temp = TempDir::new().unwrap();
        let path = StatePaths::new(temp.path()).upgrade_marker();
        UpgradeMarker::new("0.7.3", "0.7.4").write(&path).unwrap();
        let marker = UpgradeMarker::take(&path).unwrap();
        assert_eq!(marker.from_version, "0.7.3");
        assert!(UpgradeMarker::take(&path).is_none());
    }

    #[test]
    fn corrupt_marker_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("upgrade-marker.json");
        fs::write(&path, b"{broken").unwrap();
        assert!(UpgradeMarker::take(&path).is_none());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    fn write_script(path: &Path, version: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\necho \"gasoline {version}\"\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_version_from_binary() {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("gasoline");
        write_script(&exe, "0.9.1");
        assert_eq!(query_binary_version(&exe).await.as_deref(), Some("0.9.1"));
        assert!(query_binary_version(&temp.path().join("missing")).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn replaced_binary_triggers_shutdown() {
        let temp = TempDir::new().unwrap();
        let bin_dir = temp.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        let exe = bin_dir.join("gasoline");
        write_script(&exe, "0.7.4");
        let paths = StatePaths::new(temp.path().join("state"));
        let lifecycle = Arc::new(JsonlLog::lifecycle(paths.lifecycle_log()));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let guard = spawn_upgrade_watcher(
            UpgradeWatchConfig {
                exe: exe.clone(),
                current_version: "0.7.4".into(),
                marker_path: paths.upgrade_marker(),
                grace: Duration::from_millis(20),
            },
            Arc::clone(&lifecycle),
            shutdown_tx.clone(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        write_script(&exe, "0.7.5");

        tokio::time::timeout(Duration::from_secs(10), shutdown_rx.recv())
            .await
            .expect("shutdown after upgrade")
            .unwrap();
        let marker = UpgradeMarker::take(&paths.upgrade_marker()).unwrap();
        assert_eq!(marker.to_version, "0.7.5");
        let events = lifecycle.read_all();
        assert_eq!(events[0]["event"], "binary_upgrade_detected");
        guard.shutdown().await;
    }
}
