use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::{Duration, Instant};

/// Settings the assistant may push down to the extension, with their allowed values.
pub const OVERRIDE_KEYS: &[(&str, &[&str], &str)] = &[
    ("log_level", &["error", "warn", "all"], "error"),
    ("ws_mode", &["off", "lifecycle", "messages"], "lifecycle"),
    ("network_bodies", &["true", "false"], "true"),
    ("screenshot_on_error", &["true", "false"], "false"),
    ("action_replay", &["true", "false"], "true"),
];

const MIN_CHANGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("unknown capture setting '{key}' (valid: {valid})")]
    UnknownKey { key: String, valid: String },
    #[error("invalid value '{value}' for {key} (valid: {valid})")]
    InvalidValue {
        key: String,
        value: String,
        valid: String,
    },
    #[error("capture settings can change at most once per second")]
    RateLimited,
}

#[derive(Debug, Default)]
struct OverrideState {
    values: BTreeMap<String, String>,
    last_change: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct CaptureOverrides {
    inner: Mutex<OverrideState>,
}

impl CaptureOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values merged over the defaults.
    pub fn effective(&self) -> BTreeMap<String, String> {
        let guard = self.inner.lock().expect("capture overrides poisoned");
        OVERRIDE_KEYS
            .iter()
            .map(|(key, _, default)| {
                let value = guard
                    .values
                    .get(*key)
                    .cloned()
                    .unwrap_or_else(|| default.to_string());
                (key.to_string(), value)
            })
            .collect()
    }

    /// Only the keys explicitly overridden.
    pub fn overrides(&self) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .expect("capture overrides poisoned")
            .values
            .clone()
    }

    /// Applies every pair or none of them. Counts as a single change for rate limiting.
    pub fn apply(&self, changes: &BTreeMap<String, String>) -> Result<(), OverrideError> {
        for (key, value) in changes {
            validate(key, value)?;
        }
        let mut guard = self.inner.lock().expect("capture overrides poisoned");
        let now = Instant::now();
        if let Some(last) = guard.last_change {
            if now.duration_since(last) < MIN_CHANGE_INTERVAL {
                return Err(OverrideError::RateLimited);
            }
        }
        for (key, value) in changes {
            guard.values.insert(key.clone(), value.clone());
        }
        guard.last_change = Some(now);
        Ok(())
    }

    pub fn reset(&self) {
        let mut guard = self.inner.lock().expect("capture overrides poisoned");
        guard.values.clear();
        guard.last_change = Some(Instant::now());
    }
}

fn validate(key: &str, value: &str) -> Result<(), OverrideError> {
    let Some((_, allowed, _)) = OVERRIDE_KEYS.iter().find(|(name, _, _)| *name == key) else {
        let valid = OVERRIDE_KEYS
            .iter()
            .map(|(name, _, _)| *name)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(OverrideError::UnknownKey {
            key: key.to_string(),
            valid,
        });
    };
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(OverrideError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            valid: allowed.join(", "),
        })
    }
}
