use crate::domain::annotation::{
    AnnotationCompletion, AnnotationDetail, AnnotationSession, NamedAnnotationSession,
};
use chrono::Utc;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub const DETAIL_TTL: Duration = Duration::from_secs(10 * 60);
pub const MAX_SESSIONS: usize = 100;
pub const MAX_NAMED_SESSIONS: usize = 50;
pub const MAX_DETAILS: usize = 500;
const SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("tab_id is required and must be > 0")]
    InvalidTab,
    #[error("annotation store is closed")]
    Closed,
}

#[derive(Debug, Clone)]
struct Timed<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Timed<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
struct Waiter {
    session_name: Option<String>,
}

struct Inner {
    sessions: HashMap<i64, Timed<AnnotationSession>>,
    named: HashMap<String, Timed<NamedAnnotationSession>>,
    details: LruCache<String, Timed<AnnotationDetail>>,
    draw_started: HashMap<i64, Instant>,
    waiters: HashMap<String, Waiter>,
}

/// Draw-mode results: the latest session per tab, named multi-page sessions,
/// and per-element details. Expired entries are invisible immediately and
/// removed by the sweeper.
pub struct AnnotationStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationStore {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let capacity = NonZeroUsize::new(MAX_DETAILS).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                named: HashMap::new(),
                details: LruCache::new(capacity),
                draw_started: HashMap::new(),
                waiters: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Stores a finished draw session and returns the waiters it satisfies.
    /// The caller completes the matching commands.
    pub fn store_session(
        &self,
        session: AnnotationSession,
        session_name: Option<&str>,
    ) -> Result<Vec<(String, AnnotationCompletion)>, AnnotationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AnnotationError::Closed);
        }
        if session.tab_id <= 0 {
            return Err(AnnotationError::InvalidTab);
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        inner.draw_started.remove(&session.tab_id);

        if !inner.sessions.contains_key(&session.tab_id) && inner.sessions.len() >= MAX_SESSIONS {
            evict_oldest(&mut inner.sessions, |timed| timed.value.timestamp);
        }
        inner
            .sessions
            .insert(session.tab_id, Timed::new(session.clone(), SESSION_TTL));

        let named = session_name.map(|name| {
            let stamp = Utc::now().timestamp_millis();
            let fresh = match inner.named.get(name) {
                Some(existing) if existing.live(now) => false,
                _ => true,
            };
            if fresh && !inner.named.contains_key(name) && inner.named.len() >= MAX_NAMED_SESSIONS {
                evict_oldest(&mut inner.named, |timed| timed.value.updated_at);
            }
            let entry = inner.named.entry(name.to_string()).or_insert_with(|| {
                Timed::new(
                    NamedAnnotationSession {
                        name: name.to_string(),
                        pages: Vec::new(),
                        created_at: stamp,
                        updated_at: stamp,
                    },
                    SESSION_TTL,
                )
            });
            if fresh {
                entry.value.pages.clear();
                entry.value.created_at = stamp;
            }
            entry.value.pages.push(session.clone());
            entry.value.updated_at = stamp;
            entry.expires_at = now + SESSION_TTL;
            entry.value.clone()
        });

        let satisfied: Vec<(String, AnnotationCompletion)> = inner
            .waiters
            .iter()
            .filter_map(|(correlation_id, waiter)| match (&waiter.session_name, &named) {
                (Some(wanted), Some(named)) if *wanted == named.name => Some((
                    correlation_id.clone(),
                    AnnotationCompletion::Named(named.clone()),
                )),
                (Some(_), _) => None,
                (None, _) => Some((
                    correlation_id.clone(),
                    AnnotationCompletion::Session(session.clone()),
                )),
            })
            .collect();
        for (correlation_id, _) in &satisfied {
            inner.waiters.remove(correlation_id);
        }
        Ok(satisfied)
    }

    pub fn store_detail(&self, detail: AnnotationDetail) {
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        let key = detail.correlation_id.clone();
        inner.details.put(key, Timed::new(detail, DETAIL_TTL));
    }

    pub fn detail(&self, correlation_id: &str) -> Option<AnnotationDetail> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        inner
            .details
            .get(correlation_id)
            .filter(|timed| timed.live(now))
            .map(|timed| timed.value.clone())
    }

    pub fn session_for_tab(&self, tab_id: i64) -> Option<AnnotationSession> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("annotation store poisoned");
        inner
            .sessions
            .get(&tab_id)
            .filter(|timed| timed.live(now))
            .map(|timed| timed.value.clone())
    }

    pub fn latest_session(&self) -> Option<AnnotationSession> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("annotation store poisoned");
        inner
            .sessions
            .values()
            .filter(|timed| timed.live(now))
            .max_by_key(|timed| timed.value.timestamp)
            .map(|timed| timed.value.clone())
    }

    pub fn named_session(&self, name: &str) -> Option<NamedAnnotationSession> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("annotation store poisoned");
        inner
            .named
            .get(name)
            .filter(|timed| timed.live(now))
            .map(|timed| timed.value.clone())
    }

    pub fn named_sessions(&self) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("annotation store poisoned");
        let mut names: Vec<_> = inner
            .named
            .iter()
            .filter(|(_, timed)| timed.live(now))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn mark_draw_started(&self, tab_id: i64) {
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        inner.draw_started.insert(tab_id, Instant::now());
    }

    pub fn draw_in_progress(&self, tab_id: i64) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().expect("annotation store poisoned");
        inner
            .draw_started
            .get(&tab_id)
            .map_or(false, |started| now.duration_since(*started) < SESSION_TTL)
    }

    /// Registers interest in the next session (or the next page of a named session).
    pub fn register_waiter(&self, correlation_id: &str, session_name: Option<&str>) {
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        inner.waiters.insert(
            correlation_id.to_string(),
            Waiter {
                session_name: session_name.map(str::to_string),
            },
        );
    }

    pub fn cancel_waiter(&self, correlation_id: &str) {
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        inner.waiters.remove(correlation_id);
    }

    /// Physically removes expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("annotation store poisoned");
        let before = inner.sessions.len() + inner.named.len() + inner.details.len();
        inner.sessions.retain(|_, timed| timed.live(now));
        inner.named.retain(|_, timed| timed.live(now));
        let expired: Vec<String> = inner
            .details
            .iter()
            .filter(|(_, timed)| !timed.live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.details.pop(&key);
        }
        inner
            .draw_started
            .retain(|_, started| now.duration_since(*started) < SESSION_TTL);
        before - (inner.sessions.len() + inner.named.len() + inner.details.len())
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().expect("annotation store poisoned");
        (inner.sessions.len(), inner.named.len(), inner.details.len())
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Option<Duration>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = time::interval(interval.unwrap_or(SWEEP_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stopped| *stopped) => {
                        info!("annotation sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let dropped = store.sweep();
                        if dropped > 0 {
                            debug!(dropped, "annotation sweep");
                        }
                    }
                }
            }
        })
    }

    /// Stops the sweeper. Safe to call more than once and from several tasks.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn evict_oldest<K, V, F>(map: &mut HashMap<K, V>, stamp: F)
where
    K: Clone + Eq + std::hash::Hash,
    F: Fn(&V) -> i64,
{
    if let Some(oldest) = map
        .iter()
        .min_by_key(|(_, value)| stamp(value))
        .map(|(key, _)| key.clone())
    {
        map.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::annotation::Annotation;

    fn session(tab_id: i64, timestamp: i64, notes: usize) -> AnnotationSession {
        AnnotationSession {
            tab_id,
            page_url: format!("https://app.test/{tab_id}"),
            screenshot: None,
            annotations: vec![Annotation::default(); notes],
            timestamp,
        }
    }

    #[test]
    fn rejects_non_positive_tab() {
        let store = AnnotationStore::new();
        assert_eq!(
            store.store_session(session(0, 1, 1), None),
            Err(AnnotationError::InvalidTab)
        );
    }

    #[test]
    fn waiters_are_completed_once() {
        let store = AnnotationStore::new();
        store.register_waiter("ann_a", None);
        store.register_waiter("ann_b", Some("review"));
        let done = store.store_session(session(1, 10, 2), None).expect("store");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, "ann_a");

        let done = store
            .store_session(session(2, 20, 1), Some("review"))
            .expect("store");
        assert_eq!(done.len(), 1);
        match &done[0].1 {
            AnnotationCompletion::Named(named) => assert_eq!(named.pages.len(), 1),
            other => panic!("unexpected completion {other:?}"),
        }
        assert!(store.store_session(session(3, 30, 1), None).expect("store").is_empty());
    }

    #[test]
    fn named_sessions_accumulate_pages() {
        let store = AnnotationStore::new();
        store.store_session(session(1, 1, 1), Some("flow")).expect("page 1");
        store.store_session(session(1, 2, 2), Some("flow")).expect("page 2");
        let named = store.named_session("flow").expect("named");
        assert_eq!(named.pages.len(), 2);
        assert_eq!(named.annotation_count(), 3);
        assert_eq!(store.session_for_tab(1).expect("latest").timestamp, 2);
        assert_eq!(store.named_sessions(), vec!["flow".to_string()]);
    }

    #[test]
    fn session_cap_evicts_oldest() {
        let store = AnnotationStore::new();
        for tab in 1..=(MAX_SESSIONS as i64 + 1) {
            store.store_session(session(tab, tab, 0), None).expect("store");
        }
        assert_eq!(store.counts().0, MAX_SESSIONS);
        assert!(store.session_for_tab(1).is_none());
        assert_eq!(
            store.latest_session().expect("latest").tab_id,
            MAX_SESSIONS as i64 + 1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_invisible_then_swept() {
        let store = AnnotationStore::new();
        store.store_session(session(1, 1, 1), None).expect("store");
        store.store_detail(AnnotationDetail {
            correlation_id: "el_1".into(),
            ..AnnotationDetail::default()
        });
        assert!(store.detail("el_1").is_some());

        tokio::time::advance(DETAIL_TTL + Duration::from_secs(1)).await;
        assert!(store.detail("el_1").is_none());
        assert!(store.session_for_tab(1).is_some());

        tokio::time::advance(SESSION_TTL).await;
        assert!(store.session_for_tab(1).is_none());
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_sweeper() {
        let store = Arc::new(AnnotationStore::new());
        let sweeper = store.spawn_sweeper(Some(Duration::from_millis(5)));
        let closers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.close() })
            })
            .collect();
        for closer in closers {
            closer.await.expect("close");
        }
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper stopped")
            .expect("join");
        assert!(store.is_closed());
        assert_eq!(
            store.store_session(session(1, 1, 1), None),
            Err(AnnotationError::Closed)
        );
    }
}
