//! Signal delivery and port-owner lookup. Everything here degrades to a no-op
//! on platforms without POSIX signals.

use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::debug;
use which::which;

const ALIVE_POLL: Duration = Duration::from_millis(100);

#[cfg(unix)]
fn pid_of(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid).ok().map(nix::unistd::Pid::from_raw)
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    pid_of(pid).is_some_and(|pid| nix::sys::signal::kill(pid, None).is_ok())
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    let Some(target) = pid_of(pid) else {
        return false;
    };
    match nix::sys::signal::kill(target, signal) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, %err, ?signal, "signal not delivered");
            false
        }
    }
}

/// Resumes a stopped process.
#[cfg(unix)]
pub fn resume(pid: u32) -> bool {
    send(pid, nix::sys::signal::Signal::SIGCONT)
}

#[cfg(not(unix))]
pub fn resume(_pid: u32) -> bool {
    false
}

/// SIGCONT, SIGTERM, then SIGKILL once `grace` runs out. Returns whether the
/// process is gone.
#[cfg(unix)]
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::Signal;

    if pid == std::process::id() || !is_alive(pid) {
        return !is_alive(pid);
    }
    resume(pid);
    send(pid, Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        sleep(ALIVE_POLL).await;
    }
    debug!(pid, "escalating to SIGKILL");
    send(pid, Signal::SIGKILL);
    sleep(ALIVE_POLL).await;
    !is_alive(pid)
}

#[cfg(not(unix))]
pub async fn terminate(_pid: u32, _grace: Duration) -> bool {
    false
}

/// PIDs listening on the loopback TCP port, via `lsof` when installed.
pub async fn listeners_on_port(port: u16) -> Vec<u32> {
    let Ok(lsof) = which("lsof") else {
        return Vec::new();
    };
    let output = Command::new(lsof)
        .arg("-nP")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .arg("-t")
        .output()
        .await;
    match output {
        Ok(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
        Err(err) => {
            debug!(port, %err, "lsof failed");
            Vec::new()
        }
    }
}

fn parse_pids(text: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = text
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pids_skips_noise_and_duplicates() {
        assert_eq!(parse_pids("42\n\n17\n42\nCOMMAND\n"), vec![17, 42]);
        assert!(parse_pids("").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_refuses_own_pid() {
        assert!(!terminate(std::process::id(), Duration::from_millis(10)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });
        assert!(terminate(pid, Duration::from_secs(2)).await);
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }
}
