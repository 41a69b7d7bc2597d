use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const LIFECYCLE_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const FASTPATH_MAX_BYTES: u64 = 1024 * 1024;

/// Installs the global subscriber. With a log file the output never touches
/// stdout or stderr, which the MCP client owns.
pub fn init_tracing(log_file: Option<&Path>, default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();
    // a second init (tests, embedded use) keeps the first subscriber
    let _ = match log_file {
        Some(path) => {
            let file = open_append(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    };
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// What happens when a JSONL file outgrows its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Move the file to `<name>.1` and start over.
    Rotate,
    /// Drop the contents and start over.
    Truncate,
}

/// Append-only JSON-lines event file. Write failures are logged at debug
/// level and otherwise ignored.
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    max_bytes: u64,
    overflow: Overflow,
    lock: Mutex<()>,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, overflow: Overflow) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            overflow,
            lock: Mutex::new(()),
        }
    }

    pub fn lifecycle(path: impl Into<PathBuf>) -> Self {
        Self::new(path, LIFECYCLE_MAX_BYTES, Overflow::Rotate)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `{ts, event, pid, version, ..fields}`.
    pub fn record(&self, event: &str, fields: Value) {
        let mut line = Map::new();
        line.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        line.insert("event".into(), Value::String(event.to_string()));
        line.insert("pid".into(), Value::from(std::process::id()));
        line.insert("version".into(), Value::String(crate::VERSION.to_string()));
        if let Value::Object(extra) = fields {
            for (key, value) in extra {
                line.entry(key).or_insert(value);
            }
        }
        if let Err(err) = self.append(&Value::Object(line)) {
            debug!(%err, path = %self.path.display(), "telemetry write failed");
        }
    }

    fn append(&self, line: &Value) -> Result<()> {
        let _guard = self.lock.lock().expect("jsonl log poisoned");
        let size = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if size > self.max_bytes {
            match self.overflow {
                Overflow::Rotate => {
                    let mut rotated = self.path.clone().into_os_string();
                    rotated.push(".1");
                    fs::rename(&self.path, PathBuf::from(rotated))
                        .with_context(|| format!("failed to rotate {}", self.path.display()))?;
                }
                Overflow::Truncate => {
                    fs::remove_file(&self.path)
                        .with_context(|| format!("failed to truncate {}", self.path.display()))?;
                }
            }
        }
        let mut file = open_append(&self.path)?;
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');
        file.write_all(&encoded)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Parsed lines, skipping anything malformed.
    pub fn read_all(&self) -> Vec<Value> {
        fs::read_to_string(&self.path)
            .map(|text| {
                text.lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn records_carry_event_and_fields() {
        let dir = tempdir().unwrap();
        let log = JsonlLog::lifecycle(dir.path().join("lifecycle.jsonl"));
        log.record("daemon_spawned", json!({"port": 7890}));
        let lines = log.read_all();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "daemon_spawned");
        assert_eq!(lines[0]["port"], 7890);
        assert!(lines[0]["ts"].is_string());
    }

    #[test]
    fn rotates_past_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lifecycle.jsonl");
        let log = JsonlLog::new(&path, 200, Overflow::Rotate);
        for n in 0..10 {
            log.record("tick", json!({"n": n}));
        }
        assert!(dir.path().join("lifecycle.jsonl.1").exists());
        assert!(fs::metadata(&path).unwrap().len() < 400);
    }

    #[test]
    fn truncates_past_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = JsonlLog::new(&path, 200, Overflow::Truncate);
        for n in 0..10 {
            log.record("tick", json!({"n": n}));
        }
        assert!(!dir.path().join("events.jsonl.1").exists());
        assert!(log.read_all().len() < 10);
    }
}
