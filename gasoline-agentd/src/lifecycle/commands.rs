//! One-shot CLI operations: `--stop`, `--check`, `--force-cleanup`.
//!
//! Each returns a report; `main` prints it to stdout and maps it to an exit code.

use super::pid::PidFile;
use crate::adapters::daemon::signals;
use crate::bridge::fastpath::{summarize, MethodCounts};
use crate::ports::daemon::{DaemonControl, DaemonError};
use crate::state::StatePaths;
use crate::telemetry::{JsonlLog, Overflow, FASTPATH_MAX_BYTES};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const CLEANUP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub port: u16,
    pub was_running: bool,
    pub stopped: bool,
}

impl fmt::Display for StopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.was_running, self.stopped) {
            (_, false) => write!(f, "failed to stop the daemon on port {}", self.port),
            (true, true) => write!(f, "stopped gasoline on port {}", self.port),
            (false, true) => write!(f, "no gasoline daemon running on port {}", self.port),
        }
    }
}

pub async fn stop(control: &dyn DaemonControl, lifecycle: &JsonlLog) -> StopReport {
    let port = control.port();
    lifecycle.record(
        "stop_invoked",
        json!({ "port": port, "caller_pid": std::process::id() }),
    );
    let was_running = control.check_health().await.is_ok();
    let stopped = control.stop().await;
    StopReport {
        port,
        was_running,
        stopped,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DaemonStatus {
    Healthy {
        version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upgraded_from: Option<String>,
    },
    VersionMismatch {
        running: String,
        expected: String,
    },
    Foreign {
        service: String,
    },
    NotRunning {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub port: u16,
    pub state_dir: PathBuf,
    pub daemon: DaemonStatus,
    pub fastpath: BTreeMap<String, MethodCounts>,
}

impl CheckReport {
    pub fn healthy(&self) -> bool {
        matches!(self.daemon, DaemonStatus::Healthy { .. })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("gasoline {} check\n", crate::VERSION));
        out.push_str(&format!("  state dir: {}\n", self.state_dir.display()));
        let daemon = match &self.daemon {
            DaemonStatus::Healthy {
                version,
                pid,
                upgraded_from,
            } => {
                let mut line = format!("running gasoline {version}");
                if let Some(pid) = pid {
                    line.push_str(&format!(" (pid {pid})"));
                }
                if let Some(from) = upgraded_from {
                    line.push_str(&format!(", upgraded from {from}"));
                }
                line
            }
            DaemonStatus::VersionMismatch { running, expected } => {
                format!("version mismatch: running {running}, this binary is {expected}")
            }
            DaemonStatus::Foreign { service } if service.is_empty() => {
                "occupied by a non-gasoline service".to_string()
            }
            DaemonStatus::Foreign { service } => format!("occupied by {service}"),
            DaemonStatus::NotRunning { reason } => format!("not running ({reason})"),
        };
        out.push_str(&format!("  port {}: {daemon}\n", self.port));
        if self.fastpath.is_empty() {
            out.push_str("  fast path: no events recorded\n");
        } else {
            out.push_str("  fast path:\n");
            for (method, counts) in &self.fastpath {
                out.push_str(&format!(
                    "    {method}: {} ok, {} failed\n",
                    counts.success, counts.failure
                ));
            }
        }
        out
    }
}

pub async fn check(control: &dyn DaemonControl, paths: &StatePaths, expected: &str) -> CheckReport {
    let daemon = match control.check_health().await {
        Ok(report) => match report.verify(expected) {
            Ok(()) => DaemonStatus::Healthy {
                version: report.version,
                pid: report.pid,
                upgraded_from: report.upgraded_from,
            },
            Err(DaemonError::VersionMismatch { running, expected }) => {
                DaemonStatus::VersionMismatch { running, expected }
            }
            Err(DaemonError::ForeignService { service }) => DaemonStatus::Foreign { service },
            Err(other) => DaemonStatus::NotRunning {
                reason: other.to_string(),
            },
        },
        Err(DaemonError::ForeignService { service }) => DaemonStatus::Foreign { service },
        Err(err) => DaemonStatus::NotRunning {
            reason: err.to_string(),
        },
    };
    let events =
        JsonlLog::new(paths.fastpath_events(), FASTPATH_MAX_BYTES, Overflow::Truncate).read_all();
    CheckReport {
        port: control.port(),
        state_dir: paths.root().to_path_buf(),
        daemon,
        fastpath: summarize(&events),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub port_released: bool,
    pub killed: Vec<u32>,
    pub failed: Vec<u32>,
    pub removed_pid_files: Vec<PathBuf>,
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "force cleanup: {} daemon(s) terminated, {} survived, {} pid file(s) removed",
            self.killed.len(),
            self.failed.len(),
            self.removed_pid_files.len()
        )
    }
}

/// Stops the daemon on the configured port, then every daemon recorded in a
/// PID file on any port, and removes all PID files.
pub async fn force_cleanup(
    control: &dyn DaemonControl,
    paths: &StatePaths,
    lifecycle: &JsonlLog,
) -> CleanupReport {
    lifecycle.record(
        "force_cleanup_invoked",
        json!({ "port": control.port(), "caller_pid": std::process::id() }),
    );
    let mut report = CleanupReport {
        port_released: control.stop().await,
        ..CleanupReport::default()
    };

    let me = std::process::id();
    for path in pid_files(paths) {
        let file = PidFile::at(path.clone());
        if let Some(pid) = file.read().filter(|pid| *pid != me) {
            if signals::is_alive(pid) {
                if signals::terminate(pid, CLEANUP_GRACE).await {
                    report.killed.push(pid);
                } else {
                    report.failed.push(pid);
                }
            }
        }
        file.remove();
        report.removed_pid_files.push(path);
    }
    lifecycle.record(
        "force_cleanup_finished",
        json!({
            "killed": report.killed,
            "failed": report.failed,
            "pid_files": report.removed_pid_files.len(),
        }),
    );
    report
}

fn pid_files(paths: &StatePaths) -> Vec<PathBuf> {
    let entries = match fs::read_dir(paths.pids_dir()) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(%err, "no pid directory to clean");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("gasoline-") && name.ends_with(".pid"))
        })
        .collect();
    files.sort();
    files
}
