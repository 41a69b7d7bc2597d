use crate::domain::command::{CommandResult, CommandStatus, EXPIRED_BEFORE_PICKUP};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

pub const FAILED_RING_CAPACITY: usize = 100;
const RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command {0} is already registered")]
    Duplicate(String),
    #[error("command {0} not found")]
    NotFound(String),
}

#[derive(Debug)]
struct CommandEntry {
    result: CommandResult,
    status_tx: watch::Sender<CommandStatus>,
    picked_up: bool,
    deadline: Instant,
    finished: Option<Instant>,
}

#[derive(Debug, Default)]
struct CommandTable {
    commands: HashMap<String, CommandEntry>,
    failed: VecDeque<CommandResult>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub removed: usize,
}

/// Long-lived commands keyed by caller-supplied correlation ids.
///
/// A command only accepts a result while it is pending; the first terminal
/// transition wins and wakes every waiter.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    inner: Mutex<CommandTable>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        correlation_id: &str,
        kind: &str,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let mut table = self.inner.lock().expect("command registry poisoned");
        if table.commands.contains_key(correlation_id) {
            return Err(CommandError::Duplicate(correlation_id.to_string()));
        }
        let (status_tx, _) = watch::channel(CommandStatus::Pending);
        table.commands.insert(
            correlation_id.to_string(),
            CommandEntry {
                result: CommandResult {
                    correlation_id: correlation_id.to_string(),
                    kind: kind.to_string(),
                    status: CommandStatus::Pending,
                    created_at: Utc::now(),
                    completed_at: None,
                    result: None,
                    error: None,
                },
                status_tx,
                picked_up: false,
                deadline: Instant::now() + timeout,
                finished: None,
            },
        );
        Ok(())
    }

    pub fn mark_picked_up(&self, correlation_id: &str) {
        let mut table = self.inner.lock().expect("command registry poisoned");
        if let Some(entry) = table.commands.get_mut(correlation_id) {
            entry.picked_up = true;
        }
    }

    /// Applies an extension-reported outcome. Returns `false` when the command is
    /// unknown, already terminal, or the reported status is still pending.
    pub fn apply_result(
        &self,
        correlation_id: &str,
        status: CommandStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut table = self.inner.lock().expect("command registry poisoned");
        let Some(entry) = table.commands.get_mut(correlation_id) else {
            return false;
        };
        entry.picked_up = true;
        if entry.result.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        entry.result.status = status;
        entry.result.completed_at = Some(Utc::now());
        entry.result.result = result;
        entry.result.error = error;
        entry.finished = Some(Instant::now());
        entry.status_tx.send_replace(status);
        if status.is_failure() {
            let snapshot = entry.result.clone();
            push_failed(&mut table.failed, snapshot);
        }
        true
    }

    pub fn complete(&self, correlation_id: &str, result: Value) -> bool {
        self.apply_result(correlation_id, CommandStatus::Complete, Some(result), None)
    }

    /// Terminates a pending command without an extension result.
    pub fn expire(&self, correlation_id: &str, status: CommandStatus, message: &str) -> bool {
        self.apply_result(correlation_id, status, None, Some(message.to_string()))
    }

    pub fn was_picked_up(&self, correlation_id: &str) -> bool {
        let table = self.inner.lock().expect("command registry poisoned");
        table
            .commands
            .get(correlation_id)
            .map_or(false, |entry| entry.picked_up)
    }

    pub fn get(&self, correlation_id: &str) -> Option<CommandResult> {
        let table = self.inner.lock().expect("command registry poisoned");
        table
            .commands
            .get(correlation_id)
            .map(|entry| entry.result.clone())
            .or_else(|| {
                table
                    .failed
                    .iter()
                    .rev()
                    .find(|failed| failed.correlation_id == correlation_id)
                    .cloned()
            })
    }

    pub fn list_pending(&self) -> Vec<CommandResult> {
        let table = self.inner.lock().expect("command registry poisoned");
        let mut pending: Vec<_> = table
            .commands
            .values()
            .filter(|entry| entry.result.status == CommandStatus::Pending)
            .map(|entry| entry.result.clone())
            .collect();
        pending.sort_by_key(|result| result.created_at);
        pending
    }

    /// Most recent failure first.
    pub fn list_failed(&self) -> Vec<CommandResult> {
        let table = self.inner.lock().expect("command registry poisoned");
        table.failed.iter().rev().cloned().collect()
    }

    /// Blocks until the command is terminal or `max_wait` passes, then returns its
    /// current state. `None` for unknown ids.
    pub async fn wait_for_command(
        &self,
        correlation_id: &str,
        max_wait: Duration,
    ) -> Option<CommandResult> {
        let mut status_rx = {
            let table = self.inner.lock().expect("command registry poisoned");
            table.commands.get(correlation_id)?.status_tx.subscribe()
        };
        let _ = tokio::time::timeout(max_wait, status_rx.wait_for(|status| status.is_terminal()))
            .await;
        self.get(correlation_id)
    }

    /// Times out overdue pending commands and forgets finished ones past retention.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let overdue: Vec<(String, bool)> = {
            let table = self.inner.lock().expect("command registry poisoned");
            table
                .commands
                .iter()
                .filter(|(_, entry)| {
                    entry.result.status == CommandStatus::Pending && entry.deadline <= now
                })
                .map(|(id, entry)| (id.clone(), entry.picked_up))
                .collect()
        };
        let mut report = SweepReport::default();
        for (id, picked_up) in overdue {
            let applied = if picked_up {
                self.expire(&id, CommandStatus::Timeout, "command timed out")
            } else {
                self.expire(&id, CommandStatus::Expired, EXPIRED_BEFORE_PICKUP)
            };
            if applied {
                report.timed_out += 1;
            }
        }
        let mut table = self.inner.lock().expect("command registry poisoned");
        let before = table.commands.len();
        table.commands.retain(|_, entry| {
            entry
                .finished
                .map_or(true, |finished| now.duration_since(finished) < RETENTION)
        });
        report.removed = before - table.commands.len();
        report
    }
}

fn push_failed(ring: &mut VecDeque<CommandResult>, result: CommandResult) {
    if ring.len() >= FAILED_RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn waiter_is_released_on_completion() {
        let registry = Arc::new(CommandRegistry::new());
        registry
            .register("ann_1", "draw_mode", Duration::from_secs(55))
            .expect("register");
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_for_command("ann_1", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(registry.complete("ann_1", json!({"annotations": 2})));
        let result = waiter.await.expect("join").expect("known command");
        assert_eq!(result.status, CommandStatus::Complete);
        assert_eq!(result.result, Some(json!({"annotations": 2})));
    }

    #[test]
    fn first_terminal_transition_wins() {
        let registry = CommandRegistry::new();
        registry
            .register("c1", "browser_action", Duration::from_secs(35))
            .expect("register");
        assert!(!registry.apply_result("c1", CommandStatus::Pending, None, None));
        assert!(registry.apply_result("c1", CommandStatus::Error, None, Some("boom".into())));
        assert!(!registry.complete("c1", json!({})));
        let result = registry.get("c1").expect("present");
        assert_eq!(result.status, CommandStatus::Error);
        assert_eq!(registry.list_failed().len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = CommandRegistry::new();
        registry
            .register("c1", "execute", Duration::from_secs(1))
            .expect("register");
        assert_eq!(
            registry.register("c1", "execute", Duration::from_secs(1)),
            Err(CommandError::Duplicate("c1".into()))
        );
    }

    #[test]
    fn failed_ring_is_bounded() {
        let registry = CommandRegistry::new();
        for i in 0..(FAILED_RING_CAPACITY + 5) {
            let id = format!("c{i}");
            registry
                .register(&id, "execute", Duration::from_secs(1))
                .expect("register");
            registry.expire(&id, CommandStatus::Cancelled, "cancelled");
        }
        let failed = registry.list_failed();
        assert_eq!(failed.len(), FAILED_RING_CAPACITY);
        assert_eq!(failed[0].correlation_id, format!("c{}", FAILED_RING_CAPACITY + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_distinguishes_timeout_from_expiry() {
        let registry = CommandRegistry::new();
        registry
            .register("never-seen", "execute", Duration::from_secs(1))
            .expect("register");
        registry
            .register("picked", "execute", Duration::from_secs(1))
            .expect("register");
        registry.mark_picked_up("picked");
        tokio::time::advance(Duration::from_secs(2)).await;

        let report = registry.sweep();
        assert_eq!(report.timed_out, 2);
        let expired = registry.get("never-seen").expect("kept");
        assert_eq!(expired.status, CommandStatus::Expired);
        assert_eq!(expired.error.as_deref(), Some(EXPIRED_BEFORE_PICKUP));
        assert_eq!(
            registry.get("picked").expect("kept").status,
            CommandStatus::Timeout
        );

        tokio::time::advance(RETENTION + Duration::from_secs(1)).await;
        assert_eq!(registry.sweep().removed, 2);
        // failures stay visible through the failed ring
        assert!(registry.get("picked").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_pending_state_after_max_wait() {
        let registry = CommandRegistry::new();
        registry
            .register("slow", "execute", Duration::from_secs(60))
            .expect("register");
        let result = registry
            .wait_for_command("slow", Duration::from_millis(50))
            .await
            .expect("known");
        assert_eq!(result.status, CommandStatus::Pending);
        assert!(registry
            .wait_for_command("missing", Duration::from_millis(1))
            .await
            .is_none());
    }
}
