use crate::state::StatePaths;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `pids/gasoline-<port>.pid`: one line holding the daemon's PID.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn for_port(paths: &StatePaths, port: u16) -> Self {
        Self {
            path: paths.pid_file(port),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::state::create_private_dir(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{pid}")
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// `None` when the file is missing or does not hold a positive PID.
    pub fn read(&self) -> Option<u32> {
        let text = fs::read_to_string(&self.path).ok()?;
        text.trim().parse().ok().filter(|pid| *pid > 0)
    }

    pub fn remove(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(%err, path = %self.path.display(), "failed to remove pid file");
            }
        }
    }
}

/// Removes the PID file when the daemon exits, unless another process has
/// rewritten it in the meantime.
#[derive(Debug)]
pub struct PidGuard {
    file: PidFile,
    pid: u32,
}

impl PidGuard {
    pub fn acquire(file: PidFile) -> Result<Self> {
        let pid = std::process::id();
        file.write(pid)?;
        Ok(Self { file, pid })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if self.file.read() == Some(self.pid) {
            self.file.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_remove() {
        let temp = TempDir::new().unwrap();
        let file = PidFile::for_port(&StatePaths::new(temp.path()), 7890);
        assert!(file.path().ends_with("pids/gasoline-7890.pid"));
        assert_eq!(file.read(), None);
        file.write(4242).unwrap();
        assert_eq!(file.read(), Some(4242));
        file.remove();
        assert_eq!(file.read(), None);
        file.remove();
    }

    #[test]
    fn garbage_is_ignored() {
        let temp = TempDir::new().unwrap();
        let file = PidFile::for_port(&StatePaths::new(temp.path()), 1);
        fs::create_dir_all(file.path().parent().unwrap()).unwrap();
        fs::write(file.path(), "not a pid").unwrap();
        assert_eq!(file.read(), None);
        fs::write(file.path(), "0\n").unwrap();
        assert_eq!(file.read(), None);
    }

    #[test]
    fn guard_leaves_foreign_pid_alone() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let guard = PidGuard::acquire(PidFile::for_port(&paths, 9)).unwrap();
        let file = PidFile::for_port(&paths, 9);
        assert_eq!(file.read(), Some(std::process::id()));
        drop(guard);
        assert_eq!(file.read(), None);

        let guard = PidGuard::acquire(file.clone()).unwrap();
        file.write(1).unwrap();
        drop(guard);
        assert_eq!(file.read(), Some(1));
    }
}
