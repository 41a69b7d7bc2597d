use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of `GET /health` as far as a client cares about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "service-name")]
    pub service_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub upgraded_from: Option<String>,
}

impl HealthReport {
    /// `service-name`, falling back to the legacy `name` field.
    pub fn service(&self) -> &str {
        let primary = self.service_name.trim();
        if primary.is_empty() {
            self.name.trim()
        } else {
            primary
        }
    }

    /// Accepts only a gasoline daemon running `expected`.
    pub fn verify(&self, expected: &str) -> Result<(), DaemonError> {
        if !self.service().eq_ignore_ascii_case("gasoline") {
            return Err(DaemonError::ForeignService {
                service: self.service().to_string(),
            });
        }
        let running = self.version.trim();
        if running.is_empty() {
            return Err(DaemonError::VersionMismatch {
                running: "<missing>".into(),
                expected: expected.to_string(),
            });
        }
        if normalize_version(running) != normalize_version(expected) {
            return Err(DaemonError::VersionMismatch {
                running: running.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }
}

pub fn normalize_version(version: &str) -> &str {
    let trimmed = version.trim();
    trimmed.strip_prefix('v').unwrap_or(trimmed)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaemonError {
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    #[error("port occupied by non-gasoline service {service:?}")]
    ForeignService { service: String },
    #[error("server version mismatch: expected {expected}, got {running}")]
    VersionMismatch { running: String, expected: String },
    #[error("failed to start daemon: {0}")]
    Spawn(String),
    #[error("daemon not responding on port {port} after {waited_ms}ms")]
    NotReady { port: u16, waited_ms: u64 },
}

impl DaemonError {
    /// Errors that a respawn cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaemonError::ForeignService { .. } | DaemonError::VersionMismatch { .. }
        )
    }
}

/// Process-level control over the daemon bound to one loopback port.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    fn port(&self) -> u16;

    /// One `GET /health` round trip.
    async fn check_health(&self) -> Result<HealthReport, DaemonError>;

    /// Binds the port to prove it is free, releases it and launches a detached
    /// daemon. `Ok(false)` means the port was taken, usually by a daemon another
    /// client is starting.
    async fn spawn(&self) -> Result<bool, DaemonError>;

    /// Stops whatever holds the port: HTTP shutdown, then the PID file, then
    /// any listener found on the port. Returns whether the port was released.
    async fn stop(&self) -> bool;

    /// Sends SIGCONT to every process listening on the port so a frozen daemon
    /// can receive the signals that follow.
    async fn thaw(&self);
}
