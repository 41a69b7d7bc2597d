use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_DIR_ENV: &str = "GASOLINE_STATE_DIR";

/// Layout of the runtime state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--state-dir` > `$GASOLINE_STATE_DIR` > platform data dir > `~/.gasoline`.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(root) = env::var_os(STATE_DIR_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::new(root));
        }
        if let Some(data) = dirs::data_local_dir() {
            return Ok(Self::new(data.join("gasoline")));
        }
        let home = dirs::home_dir().context("cannot determine a home directory for state")?;
        Ok(Self::new(home.join(".gasoline")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn pid_file(&self, port: u16) -> PathBuf {
        self.pids_dir().join(format!("gasoline-{port}.pid"))
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn upgrade_marker(&self) -> PathBuf {
        self.root.join("upgrade-marker.json")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.logs_dir().join("daemon.log")
    }

    pub fn bridge_log(&self) -> PathBuf {
        self.logs_dir().join("bridge.log")
    }

    pub fn lifecycle_log(&self) -> PathBuf {
        self.logs_dir().join("lifecycle.jsonl")
    }

    pub fn fastpath_events(&self) -> PathBuf {
        self.logs_dir().join("bridge-fastpath-events.jsonl")
    }

    pub fn fastpath_resource_reads(&self) -> PathBuf {
        self.logs_dir().join("bridge-fastpath-resource-read.jsonl")
    }

    /// Creates the directory tree with owner/group-only permissions.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.logs_dir(),
            self.pids_dir(),
            self.screenshots_dir(),
            self.sessions_dir(),
        ] {
            create_private_dir(&dir)?;
        }
        Ok(())
    }
}

pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o750))
            .with_context(|| format!("failed to restrict {}", dir.display()))?;
    }
    Ok(())
}
