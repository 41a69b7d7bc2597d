use crate::ports::session::{RecordRepository, SessionStoreError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const RECORD_EXT: &str = "json";
const META_FILE: &str = "meta.json";
const TMP_MARKER: &str = ".tmp-";

/// Records as `<project_dir>/<namespace>/<key>.json`, written via temp file,
/// fsync and rename.
#[derive(Debug, Clone)]
pub struct FileRecordRepository {
    project_dir: PathBuf,
}

impl FileRecordRepository {
    pub fn new(project_dir: PathBuf) -> Result<Self, SessionStoreError> {
        create_private_dir(&project_dir)?;
        Ok(Self { project_dir })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    fn record_path(&self, namespace: &str, key: &str) -> Result<PathBuf, SessionStoreError> {
        let path = self
            .project_dir
            .join(namespace)
            .join(format!("{key}.{RECORD_EXT}"));
        // names are validated upstream; this guards against anything that slipped through
        if !path.starts_with(&self.project_dir) || path.components().any(|c| c.as_os_str() == "..")
        {
            return Err(SessionStoreError::InvalidName {
                what: "path",
                name: path.display().to_string(),
            });
        }
        Ok(path)
    }
}

impl RecordRepository for FileRecordRepository {
    fn read_meta(&self) -> Result<Option<Vec<u8>>, SessionStoreError> {
        read_optional(&self.project_dir.join(META_FILE))
    }

    fn write_meta(&self, bytes: &[u8]) -> Result<(), SessionStoreError> {
        write_atomic(&self.project_dir.join(META_FILE), bytes)
    }

    fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        read_optional(&self.record_path(namespace, key)?)
    }

    fn write(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError> {
        let path = self.record_path(namespace, key)?;
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }
        write_atomic(&path, bytes)
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), SessionStoreError> {
        let path = self.record_path(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionStoreError::io(
                format!("removing {}", path.display()),
                err,
            )),
        }
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, SessionStoreError> {
        let dir = self.project_dir.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(SessionStoreError::io(
                    format!("listing {}", dir.display()),
                    err,
                ))
            }
        };
        let mut keys: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.contains(TMP_MARKER) {
                    return None;
                }
                name.strip_suffix(&format!(".{RECORD_EXT}"))
                    .map(str::to_string)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn namespaces(&self) -> Result<Vec<String>, SessionStoreError> {
        let entries = fs::read_dir(&self.project_dir).map_err(|err| {
            SessionStoreError::io(format!("listing {}", self.project_dir.display()), err)
        })?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn entry_size(&self, namespace: &str, key: &str) -> Result<Option<u64>, SessionStoreError> {
        let path = self.record_path(namespace, key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SessionStoreError::io(
                format!("stat {}", path.display()),
                err,
            )),
        }
    }

    fn total_size(&self) -> Result<u64, SessionStoreError> {
        dir_size(&self.project_dir)
    }
}

fn dir_size(dir: &Path) -> Result<u64, SessionStoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(SessionStoreError::io(
                format!("listing {}", dir.display()),
                err,
            ))
        }
    };
    let mut total = 0;
    for entry in entries.filter_map(Result::ok) {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            if entry.file_name().to_string_lossy().contains(TMP_MARKER) {
                continue;
            }
            total += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, SessionStoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SessionStoreError::io(
            format!("reading {}", path.display()),
            err,
        )),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SessionStoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(
        "{file_name}{TMP_MARKER}{}",
        uuid::Uuid::new_v4().simple()
    ));
    let result = (|| {
        let mut file = create_private_file(&tmp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        replace(&tmp_path, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(SessionStoreError::io(
            format!("writing {}", path.display()),
            err,
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn replace(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

/// Without POSIX rename-over semantics the target is removed first; callers
/// serialize writers so no other write can land in between.
#[cfg(not(unix))]
fn replace(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            match fs::remove_file(to) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            fs::rename(from, to)
        }
    }
}

#[cfg(unix)]
fn create_private_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

fn create_private_dir(path: &Path) -> Result<(), SessionStoreError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }
    builder
        .create(path)
        .map_err(|err| SessionStoreError::io(format!("creating {}", path.display()), err))
}
