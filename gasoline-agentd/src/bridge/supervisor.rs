use crate::ports::daemon::{DaemonControl, DaemonError};
use crate::telemetry::JsonlLog;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    /// How long a freshly spawned daemon gets to answer `/health`.
    pub ready_timeout: Duration,
    pub restart_timeout: Duration,
    pub poll_interval: Duration,
    /// Extra health attempts against a daemon somebody else started.
    pub health_retries: u32,
    pub retry_spacing: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(4),
            restart_timeout: Duration::from_secs(6),
            poll_interval: Duration::from_millis(100),
            health_retries: 2,
            retry_spacing: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub restarted: bool,
    pub message: String,
    pub previous_stopped: bool,
}

impl RestartOutcome {
    pub fn to_result(&self) -> Value {
        let payload = json!({
            "status": if self.restarted { "ok" } else { "error" },
            "restarted": self.restarted,
            "message": self.message,
            "previous_stopped": self.previous_stopped,
        });
        let mut result = json!({
            "content": [{ "type": "text", "text": payload.to_string() }],
        });
        if !self.restarted {
            result["isError"] = Value::Bool(true);
        }
        result
    }
}

/// Owns the bridge's view of the daemon and serialises every (re)launch.
pub struct DaemonSupervisor {
    control: Arc<dyn DaemonControl>,
    version: String,
    timings: SupervisorTimings,
    state: watch::Sender<DaemonState>,
    launch: Mutex<()>,
    lifecycle: Option<Arc<JsonlLog>>,
}

impl DaemonSupervisor {
    pub fn new(
        control: Arc<dyn DaemonControl>,
        version: impl Into<String>,
        timings: SupervisorTimings,
    ) -> Self {
        let (state, _) = watch::channel(DaemonState::Starting);
        Self {
            control,
            version: version.into(),
            timings,
            state,
            launch: Mutex::new(()),
            lifecycle: None,
        }
    }

    pub fn with_lifecycle(mut self, log: Arc<JsonlLog>) -> Self {
        self.lifecycle = Some(log);
        self
    }

    pub fn port(&self) -> u16 {
        self.control.port()
    }

    pub fn state(&self) -> DaemonState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    fn record(&self, event: &str, fields: Value) {
        if let Some(log) = &self.lifecycle {
            log.record(event, fields);
        }
    }

    /// Checks health once. A healthy daemon makes the bridge ready at once; a daemon
    /// of another version or another service on the port is returned as an
    /// error. Otherwise the launch continues in the background.
    pub async fn start(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>, DaemonError> {
        self.record("connection_check", json!({ "port": self.port() }));
        match self.control.check_health().await {
            Ok(report) => {
                report.verify(&self.version)?;
                self.state.send_replace(DaemonState::Ready);
                self.record("connect_to_existing", json!({ "port": self.port() }));
                return Ok(None);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => {}
        }
        let this = Arc::clone(self);
        Ok(Some(tokio::spawn(async move {
            this.ensure_ready().await;
        })))
    }

    /// Makes sure a daemon answers, launching one if needed. Concurrent
    /// callers queue behind a single launch and share its outcome.
    pub async fn ensure_ready(&self) -> bool {
        let _launch = self.launch.lock().await;
        if self.state() == DaemonState::Ready && self.healthy().await {
            return true;
        }
        self.state.send_replace(DaemonState::Starting);
        let outcome = self.bring_up(self.timings.ready_timeout).await;
        self.settle(outcome)
    }

    /// Stops whatever holds the port and launches a fresh daemon. Works when
    /// the daemon is frozen or unresponsive.
    pub async fn restart(&self) -> RestartOutcome {
        let _launch = self.launch.lock().await;
        info!(port = self.port(), "bridge restart requested");
        self.control.thaw().await;
        let previous_stopped = self.control.stop().await;
        self.state.send_replace(DaemonState::Starting);
        let budget = self.timings.restart_timeout;
        let outcome = match timeout(budget, self.bring_up(budget)).await {
            Ok(outcome) => outcome.map_err(|err| format!("Daemon restart failed: {err}")),
            Err(_) => Err(format!(
                "Daemon restart timed out after {}s",
                budget.as_secs()
            )),
        };
        let restarted = self.settle(outcome.clone().map_err(DaemonError::Spawn));
        let message = match outcome {
            Ok(()) => "Daemon restarted successfully".to_string(),
            Err(message) => message,
        };
        self.record(
            "bridge_restart",
            json!({ "port": self.port(), "restarted": restarted, "previous_stopped": previous_stopped }),
        );
        RestartOutcome {
            restarted,
            message,
            previous_stopped,
        }
    }

    fn settle(&self, outcome: Result<(), DaemonError>) -> bool {
        match outcome {
            Ok(()) => {
                info!(port = self.port(), "daemon ready");
                self.state.send_replace(DaemonState::Ready);
                true
            }
            Err(err) => {
                let detail = match err {
                    DaemonError::Spawn(message) => message,
                    other => other.to_string(),
                };
                warn!(port = self.port(), error = %detail, "daemon unavailable");
                self.record(
                    "connection_failed",
                    json!({ "port": self.port(), "error": detail }),
                );
                self.state.send_replace(DaemonState::Failed(detail));
                false
            }
        }
    }

    async fn healthy(&self) -> bool {
        matches!(
            self.control.check_health().await,
            Ok(report) if report.verify(&self.version).is_ok()
        )
    }

    async fn bring_up(&self, ready_timeout: Duration) -> Result<(), DaemonError> {
        if self.control.spawn().await? {
            return self.wait_ready(ready_timeout).await;
        }

        let err = match self.connect_with_retries().await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => err,
        };

        self.record(
            "zombie_recovery_start",
            json!({ "port": self.port(), "error": err.to_string() }),
        );
        self.control.thaw().await;
        let stopped = self.control.stop().await;
        if !self.control.spawn().await? {
            return Err(DaemonError::Spawn(format!(
                "port {} is still occupied after recovery (stopped: {stopped})",
                self.port()
            )));
        }
        self.wait_ready(ready_timeout).await
    }

    async fn connect_with_retries(&self) -> Result<(), DaemonError> {
        let mut last = DaemonError::Unreachable("no health attempt made".into());
        for attempt in 0..=self.timings.health_retries {
            if attempt > 0 {
                self.record(
                    "connection_retry",
                    json!({ "attempt": attempt, "error": last.to_string() }),
                );
                sleep(self.timings.retry_spacing).await;
            }
            match self.control.check_health().await {
                Ok(report) => return report.verify(&self.version),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    async fn wait_ready(&self, budget: Duration) -> Result<(), DaemonError> {
        let started = Instant::now();
        let deadline = started + budget;
        loop {
            match self.control.check_health().await {
                Ok(report) => return report.verify(&self.version),
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(DaemonError::NotReady {
                    port: self.port(),
                    waited_ms: budget.as_millis() as u64,
                });
            }
            sleep(self.timings.poll_interval).await;
        }
    }
}
