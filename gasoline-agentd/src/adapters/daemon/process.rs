use super::signals;
use crate::lifecycle::pid::PidFile;
use crate::ports::daemon::{DaemonControl, DaemonError, HealthReport};
use crate::state::StatePaths;
use crate::telemetry::JsonlLog;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);
const TERM_GRACE: Duration = Duration::from_secs(2);
const RELEASE_POLL: Duration = Duration::from_millis(50);
const HEALTH_BODY_LIMIT: usize = 16 * 1024;

/// Controls a daemon process of this same executable on a loopback port.
pub struct ProcessDaemonControl {
    port: u16,
    exe: PathBuf,
    paths: StatePaths,
    api_key: Option<String>,
    client: reqwest::Client,
    lifecycle: Arc<JsonlLog>,
}

impl ProcessDaemonControl {
    pub fn new(port: u16, paths: StatePaths, api_key: Option<String>) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the gasoline executable")?;
        let lifecycle = Arc::new(JsonlLog::lifecycle(paths.lifecycle_log()));
        Ok(Self {
            port,
            exe,
            paths,
            api_key: api_key.filter(|key| !key.is_empty()),
            client: reqwest::Client::new(),
            lifecycle,
        })
    }

    pub fn with_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = exe.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    fn pid_file(&self) -> PidFile {
        PidFile::for_port(&self.paths, self.port)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(crate::API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn shutdown_via_http(&self) -> bool {
        let request = self
            .authorize(self.client.post(self.url("/shutdown")))
            .timeout(SHUTDOWN_TIMEOUT);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(port = self.port, %err, "http shutdown not accepted");
                false
            }
        }
    }

    async fn port_in_use(&self) -> bool {
        TcpStream::connect(("127.0.0.1", self.port)).await.is_ok()
    }

    async fn wait_for_release(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.port_in_use().await {
                return true;
            }
            sleep(RELEASE_POLL).await;
        }
        !self.port_in_use().await
    }

    async fn owners(&self) -> Vec<u32> {
        let me = std::process::id();
        let mut pids: Vec<u32> = self.pid_file().read().into_iter().collect();
        pids.extend(signals::listeners_on_port(self.port).await);
        pids.sort_unstable();
        pids.dedup();
        pids.retain(|pid| *pid != me);
        pids
    }
}

#[async_trait]
impl DaemonControl for ProcessDaemonControl {
    fn port(&self) -> u16 {
        self.port
    }

    async fn check_health(&self) -> Result<HealthReport, DaemonError> {
        let response = self
            .authorize(self.client.get(self.url("/health")))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| DaemonError::Unreachable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DaemonError::Unreachable(format!(
                "health endpoint returned status {}",
                status.as_u16()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| DaemonError::Unreachable(err.to_string()))?;
        let body = &body[..body.len().min(HEALTH_BODY_LIMIT)];
        serde_json::from_slice(body).map_err(|_| DaemonError::ForeignService {
            service: String::new(),
        })
    }

    async fn spawn(&self) -> Result<bool, DaemonError> {
        match std::net::TcpListener::bind(("127.0.0.1", self.port)) {
            Ok(listener) => drop(listener),
            Err(err) => {
                debug!(port = self.port, %err, "port already bound");
                self.lifecycle
                    .record("spawn_race_detected", json!({ "port": self.port }));
                return Ok(false);
            }
        }

        let mut command = Command::new(&self.exe);
        command
            .arg("--daemon")
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--state-dir")
            .arg(self.paths.root())
            .env_remove("MCP_MODE")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(key) = &self.api_key {
            command.env(crate::API_KEY_ENV, key);
        }
        #[cfg(unix)]
        unsafe {
            // detach from the bridge's session so the daemon outlives it
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }
        let child = command
            .spawn()
            .map_err(|err| DaemonError::Spawn(err.to_string()))?;
        info!(port = self.port, pid = ?child.id(), "daemon spawned");
        self.lifecycle.record(
            "daemon_spawned",
            json!({ "port": self.port, "server_pid": child.id() }),
        );
        Ok(true)
    }

    async fn stop(&self) -> bool {
        if self.shutdown_via_http().await && self.wait_for_release(SHUTDOWN_TIMEOUT).await {
            self.pid_file().remove();
            self.lifecycle
                .record("daemon_stopped", json!({ "port": self.port, "via": "http" }));
            return true;
        }

        let owners = self.owners().await;
        for pid in &owners {
            if !signals::terminate(*pid, TERM_GRACE).await {
                warn!(pid, port = self.port, "process survived SIGKILL");
            }
        }
        let released = self.wait_for_release(Duration::from_millis(1500)).await;
        if released {
            self.pid_file().remove();
        }
        self.lifecycle.record(
            "daemon_stopped",
            json!({ "port": self.port, "via": "signal", "pids": owners, "released": released }),
        );
        released
    }

    async fn thaw(&self) {
        for pid in self.owners().await {
            signals::resume(pid);
        }
    }
}
