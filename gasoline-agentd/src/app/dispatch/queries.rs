use super::{CommandError, CommandRegistry};
use crate::domain::command::{CommandStatus, EXPIRED_BEFORE_PICKUP};
use crate::domain::query::{DispatchedQuery, PendingQuery, QueryRecord, QueryStatus};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

pub const MAX_PENDING_QUERIES: usize = 5;
const RESULT_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query {0} not found")]
    NotFound(String),
    #[error("query {id} timed out waiting for the extension")]
    Timeout { id: String },
    #[error("query {id} expired: {reason}")]
    Expired { id: String, reason: String },
    #[error("query {id} failed: {message}")]
    Failed { id: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    Stored,
    /// The query had already completed; the first result stands.
    AlreadyCompleted,
    /// The query reached a different terminal state first.
    Rejected(QueryStatus),
    Unknown,
}

#[derive(Debug)]
struct QueryEntry {
    record: QueryRecord,
    status_tx: watch::Sender<QueryStatus>,
    created: Instant,
    finished: Option<Instant>,
}

/// Rendezvous between tool handlers waiting on the extension and the
/// extension's out-of-band replies.
///
/// Every entry moves `pending -> {completed, timeout, expired, error}` exactly
/// once. The transition is published on a watch channel so any number of
/// waiters observe it.
#[derive(Debug)]
pub struct QueryRegistry {
    entries: Mutex<HashMap<String, QueryEntry>>,
    next_id: AtomicU64,
    queued: Notify,
    commands: Arc<CommandRegistry>,
}

struct Finished {
    correlation_id: Option<String>,
    dispatched: bool,
    status: QueryStatus,
    result: Option<Value>,
    error: Option<String>,
}

impl QueryRegistry {
    pub fn new(commands: Arc<CommandRegistry>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queued: Notify::new(),
            commands,
        }
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    /// Registers a query and arms its timer. Queries carrying a correlation id
    /// also get a command entry so their outcome stays observable.
    pub fn create(self: &Arc<Self>, query: PendingQuery, timeout: Duration) -> String {
        let id = format!("q-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));
        if let Some(correlation_id) = &query.correlation_id {
            match self.commands.register(correlation_id, &query.kind, timeout) {
                // a retry may reuse the id; the original command entry stays authoritative
                Ok(()) | Err(CommandError::Duplicate(_)) => {}
                Err(err) => {
                    warn!(%err, correlation_id = %correlation_id, "command registration failed")
                }
            }
        }

        let overflow = {
            let mut entries = self.entries.lock().expect("query registry poisoned");
            let mut pending: Vec<(&String, Instant)> = entries
                .iter()
                .filter(|(_, entry)| entry.record.status == QueryStatus::Pending)
                .map(|(id, entry)| (id, entry.created))
                .collect();
            pending.sort_by_key(|(_, created)| *created);
            let excess = (pending.len() + 1).saturating_sub(MAX_PENDING_QUERIES);
            let overflow: Vec<String> = pending
                .into_iter()
                .take(excess)
                .map(|(id, _)| id.clone())
                .collect();

            let (status_tx, _) = watch::channel(QueryStatus::Pending);
            entries.insert(
                id.clone(),
                QueryEntry {
                    record: QueryRecord {
                        id: id.clone(),
                        kind: query.kind,
                        params: query.params,
                        tab_id: query.tab_id,
                        correlation_id: query.correlation_id,
                        created_at: now,
                        deadline,
                        status: QueryStatus::Pending,
                        result: None,
                        error: None,
                        dispatched: false,
                        completed_at: None,
                    },
                    status_tx,
                    created: Instant::now(),
                    finished: None,
                },
            );
            overflow
        };
        for stale in overflow {
            debug!(query = %stale, "expiring oldest pending query on overflow");
            self.finish(&stale, QueryStatus::Expired, None, Some("query queue overflow".into()));
        }
        self.queued.notify_waiters();

        let registry = Arc::downgrade(self);
        let timer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.finish(
                    &timer_id,
                    QueryStatus::Timeout,
                    None,
                    Some("timed out waiting for extension".into()),
                );
            }
        });
        id
    }

    /// Stores the extension's result. First writer wins.
    pub fn set_result(&self, id: &str, result: Value) -> SetOutcome {
        let current = {
            let entries = self.entries.lock().expect("query registry poisoned");
            entries.get(id).map(|entry| entry.record.status)
        };
        match current {
            None => SetOutcome::Unknown,
            Some(QueryStatus::Completed) => SetOutcome::AlreadyCompleted,
            Some(QueryStatus::Pending) => {
                if self.finish(id, QueryStatus::Completed, Some(result), None) {
                    SetOutcome::Stored
                } else {
                    self.status(id)
                        .map_or(SetOutcome::Unknown, |status| match status {
                            QueryStatus::Completed => SetOutcome::AlreadyCompleted,
                            other => SetOutcome::Rejected(other),
                        })
                }
            }
            Some(other) => SetOutcome::Rejected(other),
        }
    }

    pub fn set_error(&self, id: &str, message: impl Into<String>) -> bool {
        self.finish(id, QueryStatus::Error, None, Some(message.into()))
    }

    pub fn status(&self, id: &str) -> Option<QueryStatus> {
        let entries = self.entries.lock().expect("query registry poisoned");
        entries.get(id).map(|entry| entry.record.status)
    }

    pub fn get(&self, id: &str) -> Option<QueryRecord> {
        let entries = self.entries.lock().expect("query registry poisoned");
        entries.get(id).map(|entry| entry.record.clone())
    }

    /// Waits for a terminal state. If `max_wait` elapses first the query is
    /// timed out, so the caller always sees a final outcome.
    pub async fn wait_for_result(&self, id: &str, max_wait: Duration) -> Result<Value, QueryError> {
        let mut status_rx = {
            let entries = self.entries.lock().expect("query registry poisoned");
            entries
                .get(id)
                .ok_or_else(|| QueryError::NotFound(id.to_string()))?
                .status_tx
                .subscribe()
        };
        let waited =
            tokio::time::timeout(max_wait, status_rx.wait_for(|status| status.is_terminal())).await;
        if waited.is_err() {
            self.finish(
                id,
                QueryStatus::Timeout,
                None,
                Some("timed out waiting for extension".into()),
            );
        }
        let record = self
            .get(id)
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;
        match record.status {
            QueryStatus::Completed => Ok(record.result.unwrap_or(Value::Null)),
            QueryStatus::Timeout | QueryStatus::Pending => {
                Err(QueryError::Timeout { id: id.to_string() })
            }
            QueryStatus::Expired => Err(QueryError::Expired {
                id: id.to_string(),
                reason: record.error.unwrap_or_else(|| "expired".into()),
            }),
            QueryStatus::Error => Err(QueryError::Failed {
                id: id.to_string(),
                message: record.error.unwrap_or_else(|| "extension error".into()),
            }),
        }
    }

    /// Pending queries not yet handed to the extension. Each query is handed out once.
    pub fn take_dispatchable(&self) -> Vec<DispatchedQuery> {
        let (batch, picked): (Vec<DispatchedQuery>, Vec<String>) = {
            let mut entries = self.entries.lock().expect("query registry poisoned");
            let mut ready: Vec<&mut QueryEntry> = entries
                .values_mut()
                .filter(|entry| {
                    entry.record.status == QueryStatus::Pending && !entry.record.dispatched
                })
                .collect();
            ready.sort_by_key(|entry| entry.created);
            let mut picked = Vec::new();
            let batch = ready
                .into_iter()
                .map(|entry| {
                    entry.record.dispatched = true;
                    if let Some(correlation_id) = &entry.record.correlation_id {
                        picked.push(correlation_id.clone());
                    }
                    DispatchedQuery::from(&entry.record)
                })
                .collect();
            (batch, picked)
        };
        for correlation_id in picked {
            self.commands.mark_picked_up(&correlation_id);
        }
        batch
    }

    /// Long-poll helper for the extension: returns as soon as work is queued or
    /// `max_wait` passes.
    pub async fn wait_for_dispatchable(&self, max_wait: Duration) -> Vec<DispatchedQuery> {
        let notified = self.queued.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let ready = self.take_dispatchable();
        if !ready.is_empty() {
            return ready;
        }
        let _ = tokio::time::timeout(max_wait, notified).await;
        self.take_dispatchable()
    }

    pub fn has_undispatched(&self) -> bool {
        let entries = self.entries.lock().expect("query registry poisoned");
        entries
            .values()
            .any(|entry| entry.record.status == QueryStatus::Pending && !entry.record.dispatched)
    }

    /// Expires every pending query, e.g. when the extension disconnects.
    pub fn expire_all(&self, reason: &str) -> usize {
        let pending: Vec<String> = {
            let entries = self.entries.lock().expect("query registry poisoned");
            entries
                .iter()
                .filter(|(_, entry)| entry.record.status == QueryStatus::Pending)
                .map(|(id, _)| id.clone())
                .collect()
        };
        pending
            .iter()
            .filter(|id| self.finish(id, QueryStatus::Expired, None, Some(reason.to_string())))
            .count()
    }

    pub fn list_pending(&self) -> Vec<QueryRecord> {
        self.list_where(|status| status == QueryStatus::Pending)
    }

    pub fn list_completed(&self) -> Vec<QueryRecord> {
        self.list_where(|status| status == QueryStatus::Completed)
    }

    pub fn list_failed(&self) -> Vec<QueryRecord> {
        self.list_where(|status| status.is_terminal() && status != QueryStatus::Completed)
    }

    pub fn pending_count(&self) -> usize {
        let entries = self.entries.lock().expect("query registry poisoned");
        entries
            .values()
            .filter(|entry| entry.record.status == QueryStatus::Pending)
            .count()
    }

    /// Drops terminal entries older than the retention window.
    pub fn purge_finished(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("query registry poisoned");
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .finished
                .map_or(true, |finished| now.duration_since(finished) < RESULT_RETENTION)
        });
        before - entries.len()
    }

    fn list_where(&self, keep: impl Fn(QueryStatus) -> bool) -> Vec<QueryRecord> {
        let entries = self.entries.lock().expect("query registry poisoned");
        let mut records: Vec<_> = entries
            .values()
            .filter(|entry| keep(entry.record.status))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// The single transition out of `pending`. Returns `false` if the query was
    /// unknown or already terminal.
    fn finish(
        &self,
        id: &str,
        status: QueryStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let finished = {
            let mut entries = self.entries.lock().expect("query registry poisoned");
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            if entry.record.status.is_terminal() {
                return false;
            }
            entry.record.status = status;
            entry.record.result = result.clone();
            entry.record.error = error.clone();
            entry.record.completed_at = Some(Utc::now());
            entry.finished = Some(Instant::now());
            entry.status_tx.send_replace(status);
            Finished {
                correlation_id: entry.record.correlation_id.clone(),
                dispatched: entry.record.dispatched,
                status,
                result,
                error,
            }
        };
        self.propagate_to_command(finished);
        true
    }

    fn propagate_to_command(&self, finished: Finished) {
        let Some(correlation_id) = finished.correlation_id else {
            return;
        };
        let message = finished.error.unwrap_or_default();
        match finished.status {
            QueryStatus::Completed => {
                self.commands
                    .complete(&correlation_id, finished.result.unwrap_or(Value::Null));
            }
            QueryStatus::Error => {
                self.commands
                    .expire(&correlation_id, CommandStatus::Error, &message);
            }
            QueryStatus::Timeout | QueryStatus::Expired
                if !finished.dispatched && !self.commands.was_picked_up(&correlation_id) =>
            {
                self.commands
                    .expire(&correlation_id, CommandStatus::Expired, EXPIRED_BEFORE_PICKUP);
            }
            QueryStatus::Timeout => {
                self.commands
                    .expire(&correlation_id, CommandStatus::Timeout, &message);
            }
            QueryStatus::Expired => {
                self.commands
                    .expire(&correlation_id, CommandStatus::Expired, &message);
            }
            QueryStatus::Pending => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<QueryRegistry> {
        Arc::new(QueryRegistry::new(Arc::new(CommandRegistry::new())))
    }

    #[tokio::test]
    async fn result_releases_all_waiters() {
        let registry = registry();
        let id = registry.create(PendingQuery::new("a11y", json!({})), Duration::from_secs(30));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move {
                    registry
                        .wait_for_result(&id, Duration::from_secs(5))
                        .await
                })
            })
            .collect();
        tokio::task::yield_now().await;
        assert_eq!(registry.set_result(&id, json!({"violations": []})), SetOutcome::Stored);
        for waiter in waiters {
            let value = waiter.await.expect("join").expect("result");
            assert_eq!(value, json!({"violations": []}));
        }
    }

    #[tokio::test]
    async fn first_writer_wins() {
        let registry = registry();
        let id = registry.create(PendingQuery::new("dom", json!({})), Duration::from_secs(30));
        assert_eq!(registry.set_result(&id, json!(1)), SetOutcome::Stored);
        assert_eq!(registry.set_result(&id, json!(2)), SetOutcome::AlreadyCompleted);
        let value = registry
            .wait_for_result(&id, Duration::from_millis(10))
            .await
            .expect("completed");
        assert_eq!(value, json!(1));
        assert_eq!(registry.set_result("q-999", json!(1)), SetOutcome::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_times_out_and_blocks_late_results() {
        let registry = registry();
        let id = registry.create(
            PendingQuery::new("screenshot", json!({})),
            Duration::from_secs(20),
        );
        let err = registry
            .wait_for_result(&id, Duration::from_secs(60))
            .await
            .expect_err("timeout");
        assert_eq!(err, QueryError::Timeout { id: id.clone() });
        assert_eq!(
            registry.set_result(&id, json!({})),
            SetOutcome::Rejected(QueryStatus::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_wait_still_returns_terminal_status() {
        let registry = registry();
        let id = registry.create(PendingQuery::new("dom", json!({})), Duration::from_secs(60));
        let err = registry
            .wait_for_result(&id, Duration::from_millis(100))
            .await
            .expect_err("elapsed");
        assert!(matches!(err, QueryError::Timeout { .. }));
        assert_eq!(registry.status(&id), Some(QueryStatus::Timeout));
        assert_eq!(registry.list_failed().len(), 1);
    }

    #[tokio::test]
    async fn overflow_expires_oldest_pending() {
        let registry = registry();
        let ids: Vec<_> = (0..=MAX_PENDING_QUERIES)
            .map(|i| {
                registry.create(
                    PendingQuery::new("dom", json!({ "i": i })),
                    Duration::from_secs(30),
                )
            })
            .collect();
        assert_eq!(registry.pending_count(), MAX_PENDING_QUERIES);
        assert_eq!(registry.status(&ids[0]), Some(QueryStatus::Expired));
        assert_eq!(registry.status(&ids[MAX_PENDING_QUERIES]), Some(QueryStatus::Pending));
    }

    #[tokio::test]
    async fn dispatch_hands_out_each_query_once_and_marks_command() {
        let registry = registry();
        let id = registry.create(
            PendingQuery::new("browser_action", json!({"action": "refresh"}))
                .with_tab(Some(3))
                .with_correlation("corr-1"),
            Duration::from_secs(30),
        );
        let batch = registry.wait_for_dispatchable(Duration::from_millis(10)).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].tab_id, Some(3));
        assert!(registry.take_dispatchable().is_empty());
        assert!(registry.commands().was_picked_up("corr-1"));

        registry.set_result(&id, json!({"success": true}));
        let command = registry.commands().get("corr-1").expect("command");
        assert_eq!(command.status, CommandStatus::Complete);
    }

    #[tokio::test]
    async fn retried_correlation_id_keeps_original_command() {
        let registry = registry();
        let first = registry.create(
            PendingQuery::new("execute", json!({"script": "1"})).with_correlation("corr-r"),
            Duration::from_secs(30),
        );
        let retry = registry.create(
            PendingQuery::new("browser_action", json!({})).with_correlation("corr-r"),
            Duration::from_secs(30),
        );
        assert_ne!(first, retry);
        assert_eq!(registry.pending_count(), 2);
        assert_eq!(registry.commands().list_pending().len(), 1);
        let command = registry.commands().get("corr-r").expect("command");
        assert_eq!(command.kind, "execute");
        assert_eq!(command.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn long_poll_wakes_on_new_query() {
        let registry = registry();
        let poller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_for_dispatchable(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        registry.create(PendingQuery::new("dom", json!({})), Duration::from_secs(30));
        let batch = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("woke before timeout")
            .expect("join");
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn expire_all_marks_undispatched_commands_expired() {
        let registry = registry();
        registry.create(
            PendingQuery::new("execute", json!({})).with_correlation("corr-x"),
            Duration::from_secs(30),
        );
        assert_eq!(registry.expire_all("extension_disconnected"), 1);
        let command = registry.commands().get("corr-x").expect("command");
        assert_eq!(command.status, CommandStatus::Expired);
        assert_eq!(command.error.as_deref(), Some(EXPIRED_BEFORE_PICKUP));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_old_terminal_entries() {
        let registry = registry();
        let id = registry.create(PendingQuery::new("dom", json!({})), Duration::from_secs(30));
        registry.set_result(&id, json!(true));
        assert_eq!(registry.purge_finished(), 0);
        tokio::time::advance(RESULT_RETENTION + Duration::from_secs(1)).await;
        assert_eq!(registry.purge_finished(), 1);
        assert!(registry.get(&id).is_none());
    }
}
