use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::time::{Duration, Instant};

/// Gap between syncs after which the extension counts as gone.
pub const DISCONNECT_THRESHOLD: Duration = Duration::from_secs(10);

/// Tab-tracking settings pushed by the extension on every sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSettings {
    #[serde(default)]
    pub pilot_enabled: bool,
    #[serde(default)]
    pub tracking_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_tab_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_tab_title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtensionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub settings: ExtensionSettings,
}

#[derive(Debug, Default)]
struct Inner {
    last_sync: Option<Instant>,
    last_sync_wall: Option<DateTime<Utc>>,
    session_id: Option<String>,
    version: Option<String>,
    settings: ExtensionSettings,
}

/// What the daemon knows about the connected browser extension.
#[derive(Debug, Default)]
pub struct ExtensionState {
    inner: RwLock<Inner>,
}

/// Result of recording a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncGap {
    First,
    Continuous,
    /// Previous sync was long enough ago that outstanding work is stale.
    Reconnected,
}

impl ExtensionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sync(
        &self,
        session_id: Option<String>,
        version: Option<String>,
        settings: Option<ExtensionSettings>,
    ) -> SyncGap {
        let now = Instant::now();
        let mut guard = self.inner.write().expect("extension state poisoned");
        let gap = match guard.last_sync {
            None => SyncGap::First,
            Some(last) if now.duration_since(last) >= DISCONNECT_THRESHOLD => SyncGap::Reconnected,
            Some(_) => SyncGap::Continuous,
        };
        guard.last_sync = Some(now);
        guard.last_sync_wall = Some(Utc::now());
        if session_id.is_some() {
            guard.session_id = session_id;
        }
        if version.is_some() {
            guard.version = version;
        }
        if let Some(settings) = settings {
            guard.settings = settings;
        }
        gap
    }

    pub fn update_settings(&self, settings: ExtensionSettings) {
        self.inner
            .write()
            .expect("extension state poisoned")
            .settings = settings;
    }

    pub fn is_connected(&self) -> bool {
        let guard = self.inner.read().expect("extension state poisoned");
        guard
            .last_sync
            .map_or(false, |last| last.elapsed() < DISCONNECT_THRESHOLD)
    }

    /// Tracked tab id when tracking is on.
    pub fn tracked_tab(&self) -> Option<i64> {
        let guard = self.inner.read().expect("extension state poisoned");
        if guard.settings.tracking_enabled {
            guard.settings.tracked_tab_id
        } else {
            None
        }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.inner
            .read()
            .expect("extension state poisoned")
            .settings
            .tracking_enabled
    }

    pub fn status(&self) -> ExtensionStatus {
        let guard = self.inner.read().expect("extension state poisoned");
        ExtensionStatus {
            connected: guard
                .last_sync
                .map_or(false, |last| last.elapsed() < DISCONNECT_THRESHOLD),
            session_id: guard.session_id.clone(),
            version: guard.version.clone(),
            last_sync: guard.last_sync_wall,
            settings: guard.settings.clone(),
        }
    }
}
