use crate::adapters::daemon::signals;
use crate::ports::daemon::{DaemonControl, DaemonError, HealthReport};
use std::fmt;

/// Who holds a port the daemon wanted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOwner {
    Gasoline { version: String, pid: Option<u32> },
    Foreign { pids: Vec<u32> },
}

/// One-line explanation of why the daemon cannot bind, with a command that
/// frees the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    pub owner: PortOwner,
}

impl PortConflict {
    pub fn from_health(
        port: u16,
        health: Result<HealthReport, DaemonError>,
        listeners: Vec<u32>,
    ) -> Self {
        let owner = match health {
            Ok(report) if report.service().eq_ignore_ascii_case("gasoline") => PortOwner::Gasoline {
                version: report.version,
                pid: report.pid.or_else(|| listeners.first().copied()),
            },
            _ => PortOwner::Foreign { pids: listeners },
        };
        Self { port, owner }
    }

    pub fn kill_hint(&self) -> String {
        match &self.owner {
            PortOwner::Gasoline { .. } => format!("gasoline --stop --port {}", self.port),
            PortOwner::Foreign { pids } if !pids.is_empty() => {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                format!("kill {}", pids.join(" "))
            }
            PortOwner::Foreign { .. } => {
                format!("lsof -nP -iTCP:{} -sTCP:LISTEN", self.port)
            }
        }
    }
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            PortOwner::Gasoline { version, pid } => {
                write!(f, "port {} is already used by gasoline {version}", self.port)?;
                if let Some(pid) = pid {
                    write!(f, " (pid {pid})")?;
                }
                write!(f, "; stop it with: {}", self.kill_hint())
            }
            PortOwner::Foreign { pids } if !pids.is_empty() => write!(
                f,
                "port {} is in use by another process; free it with: {}",
                self.port,
                self.kill_hint()
            ),
            PortOwner::Foreign { .. } => write!(
                f,
                "port {} is in use by another process; find it with: {}",
                self.port,
                self.kill_hint()
            ),
        }
    }
}

/// `None` when the loopback port can be bound right now.
pub async fn check_port(control: &dyn DaemonControl) -> Option<PortConflict> {
    let port = control.port();
    if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
        return None;
    }
    let health = control.check_health().await;
    let me = std::process::id();
    let mut listeners = signals::listeners_on_port(port).await;
    listeners.retain(|pid| *pid != me);
    Some(PortConflict::from_health(port, health, listeners))
}
