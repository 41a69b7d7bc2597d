use crate::adapters::session::FileRecordRepository;
use crate::domain::session::{ErrorHistoryEntry, ProjectId, SessionContext, SessionMeta};
use crate::ports::session::{RecordRepository, SessionStoreError};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const MAX_ENTRY_BYTES: usize = 1024 * 1024;
pub const MAX_PROJECT_BYTES: u64 = 10 * 1024 * 1024;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub project_id: ProjectId,
    pub session_count: u64,
    pub namespaces: BTreeMap<String, usize>,
    pub total_bytes: u64,
    pub dirty_entries: usize,
}

#[derive(Debug, Clone)]
struct DirtyEntry {
    namespace: String,
    key: String,
    bytes: Vec<u8>,
    generation: u64,
}

/// Per-project persistent key/value state.
///
/// Writes are serialized behind `write_lock` so the quota check and the write
/// it guards cannot interleave with another writer. Buffered records stay in
/// `dirty` until they are on disk; `load` prefers them over the repository.
/// Lock order: `write_lock` before `dirty`.
pub struct SessionStore {
    repo: Arc<dyn RecordRepository>,
    meta: Mutex<SessionMeta>,
    meta_dirty: AtomicBool,
    write_lock: Mutex<()>,
    dirty: Mutex<HashMap<String, DirtyEntry>>,
    generation: AtomicU64,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl SessionStore {
    /// Opens `<root>/<project_hash>/`, bumping the session counter.
    pub fn open(root: &Path, project_path: &Path) -> Result<Arc<Self>, SessionStoreError> {
        let project_id = ProjectId::for_path(project_path);
        let repo = FileRecordRepository::new(root.join(project_id.as_str()))?;
        Self::with_repository(Arc::new(repo), project_path)
    }

    pub fn with_repository(
        repo: Arc<dyn RecordRepository>,
        project_path: &Path,
    ) -> Result<Arc<Self>, SessionStoreError> {
        let project_id = ProjectId::for_path(project_path);
        let now = Utc::now();
        let meta = match repo.read_meta()? {
            Some(bytes) => match serde_json::from_slice::<SessionMeta>(&bytes) {
                Ok(existing) => existing.reopened(now),
                Err(err) => {
                    warn!(%err, project = %project_id, "corrupt session meta; starting fresh");
                    SessionMeta::fresh(project_id, project_path, now)
                }
            },
            None => SessionMeta::fresh(project_id, project_path, now),
        };
        let encoded = serde_json::to_vec_pretty(&meta).map_err(|source| {
            SessionStoreError::Decode {
                what: "session meta".into(),
                source,
            }
        })?;
        repo.write_meta(&encoded)?;
        info!(project = %meta.project_id, sessions = meta.session_count, "session store opened");

        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            repo,
            meta: Mutex::new(meta),
            meta_dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            dirty: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stop_tx,
        }))
    }

    pub fn project_id(&self) -> ProjectId {
        self.meta.lock().expect("session meta poisoned").project_id.clone()
    }

    pub fn meta(&self) -> SessionMeta {
        self.meta.lock().expect("session meta poisoned").clone()
    }

    pub fn save(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError> {
        self.ensure_open()?;
        validate_name("namespace", namespace)?;
        validate_name("key", key)?;
        check_entry_size(namespace, key, bytes.len())?;
        let _guard = self.write_lock.lock().expect("session write lock poisoned");
        self.write_checked(namespace, key, bytes)?;
        // a direct save supersedes any buffered write of the same record
        self.dirty
            .lock()
            .expect("session dirty buffer poisoned")
            .remove(&dirty_key(namespace, key));
        Ok(())
    }

    /// Buffers a write for the next flush.
    pub fn mark_dirty(
        &self,
        namespace: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SessionStoreError> {
        self.ensure_open()?;
        validate_name("namespace", namespace)?;
        validate_name("key", key)?;
        check_entry_size(namespace, key, bytes.len())?;
        self.dirty.lock().expect("session dirty buffer poisoned").insert(
            dirty_key(namespace, key),
            DirtyEntry {
                namespace: namespace.to_string(),
                key: key.to_string(),
                bytes,
                generation: self.generation.fetch_add(1, Ordering::SeqCst),
            },
        );
        Ok(())
    }

    pub fn load(&self, namespace: &str, key: &str) -> Result<Vec<u8>, SessionStoreError> {
        validate_name("namespace", namespace)?;
        validate_name("key", key)?;
        if let Some(entry) = self
            .dirty
            .lock()
            .expect("session dirty buffer poisoned")
            .get(&dirty_key(namespace, key))
        {
            return Ok(entry.bytes.clone());
        }
        self.repo
            .read(namespace, key)?
            .ok_or_else(|| SessionStoreError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    pub fn list(&self, namespace: &str) -> Result<Vec<String>, SessionStoreError> {
        validate_name("namespace", namespace)?;
        self.repo.keys(namespace)
    }

    pub fn delete(&self, namespace: &str, key: &str) -> Result<(), SessionStoreError> {
        self.ensure_open()?;
        validate_name("namespace", namespace)?;
        validate_name("key", key)?;
        let _guard = self.write_lock.lock().expect("session write lock poisoned");
        self.dirty
            .lock()
            .expect("session dirty buffer poisoned")
            .remove(&dirty_key(namespace, key));
        self.repo.remove(namespace, key)
    }

    pub fn stats(&self) -> Result<SessionStats, SessionStoreError> {
        let mut namespaces = BTreeMap::new();
        for namespace in self.repo.namespaces()? {
            let count = self.repo.keys(&namespace)?.len();
            namespaces.insert(namespace, count);
        }
        let meta = self.meta();
        Ok(SessionStats {
            project_id: meta.project_id,
            session_count: meta.session_count,
            namespaces,
            total_bytes: self.repo.total_size()?,
            dirty_entries: self.dirty.lock().expect("session dirty buffer poisoned").len(),
        })
    }

    /// Everything a new session needs in one read.
    pub fn load_session_context(&self) -> Result<SessionContext, SessionStoreError> {
        let meta = self.meta();
        let mut baselines = Map::new();
        for key in self.repo.keys("baselines")? {
            match self.load("baselines", &key).map(|bytes| serde_json::from_slice::<Value>(&bytes)) {
                Ok(Ok(value)) => {
                    baselines.insert(key, value);
                }
                Ok(Err(err)) => warn!(%err, %key, "skipping malformed baseline"),
                Err(err) => warn!(%err, %key, "skipping unreadable baseline"),
            }
        }
        let error_history = match self.optional_json("errors", "history")? {
            Some(value) => {
                serde_json::from_value::<Vec<ErrorHistoryEntry>>(value).unwrap_or_else(|err| {
                    warn!(%err, "malformed error history; ignoring");
                    Vec::new()
                })
            }
            None => Vec::new(),
        };
        Ok(SessionContext {
            project_id: meta.project_id,
            session_count: meta.session_count,
            baselines,
            noise_config: self.optional_json("noise", "config")?,
            error_history,
            api_schema: self.optional_json("api_schema", "schema")?,
            performance: self.optional_json("performance", "endpoints")?,
        })
    }

    /// Persists every buffered write. An entry leaves the buffer only once
    /// its bytes are on disk and no newer write for the record arrived; a
    /// `save` or `delete` that lands first makes the buffered copy stale and
    /// it is skipped.
    pub fn flush(&self) -> usize {
        let pending: Vec<(String, DirtyEntry)> = self
            .dirty
            .lock()
            .expect("session dirty buffer poisoned")
            .iter()
            .map(|(slot, entry)| (slot.clone(), entry.clone()))
            .collect();
        let mut written = 0;
        for (slot, entry) in pending {
            let _guard = self.write_lock.lock().expect("session write lock poisoned");
            if !self.is_current(&slot, entry.generation) {
                continue;
            }
            match self.write_checked(&entry.namespace, &entry.key, &entry.bytes) {
                Ok(()) => {
                    written += 1;
                    let mut dirty = self.dirty.lock().expect("session dirty buffer poisoned");
                    let unchanged = dirty
                        .get(&slot)
                        .is_some_and(|current| current.generation == entry.generation);
                    if unchanged {
                        dirty.remove(&slot);
                    }
                }
                Err(err) => warn!(%err, record = %slot, "flush failed; will retry"),
            }
        }
        if self.meta_dirty.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.persist_meta() {
                self.meta_dirty.store(true, Ordering::SeqCst);
                warn!(%err, "persisting session meta failed");
            }
        }
        if written > 0 {
            debug!(written, "session store flushed");
        }
        written
    }

    /// Periodic flusher; stops when [`SessionStore::shutdown`] is called.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Option<Duration>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = time::interval(interval.unwrap_or(FLUSH_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = async { let _ = stop_rx.wait_for(|stopped| *stopped).await; } => break,
                    _ = ticker.tick() => {
                        let store = Arc::clone(&store);
                        if let Err(err) = tokio::task::spawn_blocking(move || store.flush()).await {
                            warn!(%err, "session flush task failed");
                        }
                    }
                }
            }
        })
    }

    /// Flushes remaining writes and refuses further mutation. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        self.meta_dirty.store(true, Ordering::SeqCst);
        let written = self.flush();
        let left = self.dirty.lock().expect("session dirty buffer poisoned").len();
        if left > 0 {
            warn!(left, "session store shut down with unflushed entries");
        }
        info!(written, "session store shut down");
    }

    fn ensure_open(&self) -> Result<(), SessionStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SessionStoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn is_current(&self, slot: &str, generation: u64) -> bool {
        self.dirty
            .lock()
            .expect("session dirty buffer poisoned")
            .get(slot)
            .map(|entry| entry.generation)
            == Some(generation)
    }

    /// Caller holds `write_lock`.
    fn write_checked(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError> {
        let current = self.repo.total_size()?;
        let replaced = self.repo.entry_size(namespace, key)?.unwrap_or(0);
        let incoming = bytes.len() as u64;
        if current.saturating_sub(replaced) + incoming > MAX_PROJECT_BYTES {
            return Err(SessionStoreError::QuotaExceeded {
                current,
                incoming,
                limit: MAX_PROJECT_BYTES,
            });
        }
        self.repo.write(namespace, key, bytes)?;
        self.meta.lock().expect("session meta poisoned").last_access = Some(Utc::now());
        self.meta_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn persist_meta(&self) -> Result<(), SessionStoreError> {
        let meta = self.meta();
        let encoded = serde_json::to_vec_pretty(&meta).map_err(|source| {
            SessionStoreError::Decode {
                what: "session meta".into(),
                source,
            }
        })?;
        let _guard = self.write_lock.lock().expect("session write lock poisoned");
        self.repo.write_meta(&encoded)
    }

    fn optional_json(&self, namespace: &str, key: &str) -> Result<Option<Value>, SessionStoreError> {
        match self.load(namespace, key) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn dirty_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

fn validate_name(what: &'static str, name: &str) -> Result<(), SessionStoreError> {
    let bad = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        Err(SessionStoreError::InvalidName {
            what,
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

fn check_entry_size(namespace: &str, key: &str, size: usize) -> Result<(), SessionStoreError> {
    if size > MAX_ENTRY_BYTES {
        Err(SessionStoreError::EntryTooLarge {
            namespace: namespace.to_string(),
            key: key.to_string(),
            size,
            limit: MAX_ENTRY_BYTES,
        })
    } else {
        Ok(())
    }
}
