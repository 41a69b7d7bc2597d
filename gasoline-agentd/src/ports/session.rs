use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("invalid {what} name: {name:?}")]
    InvalidName { what: &'static str, name: String },
    #[error("entry {namespace}/{key} is {size} bytes; the per-file limit is {limit} bytes")]
    EntryTooLarge {
        namespace: String,
        key: String,
        size: usize,
        limit: usize,
    },
    #[error("project size limit exceeded: {current} + {incoming} bytes would exceed {limit} bytes")]
    QuotaExceeded {
        current: u64,
        incoming: u64,
        limit: u64,
    },
    #[error("key not found: {namespace}/{key}")]
    NotFound { namespace: String, key: String },
    #[error("session store is shut down")]
    Closed,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SessionStoreError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionStoreError::NotFound { .. })
    }
}

/// Byte-level storage for one project's records.
///
/// Implementations must make `write` atomic: a concurrent reader sees the old
/// bytes or the new bytes, never a mix.
pub trait RecordRepository: Send + Sync {
    fn read_meta(&self) -> Result<Option<Vec<u8>>, SessionStoreError>;
    fn write_meta(&self, bytes: &[u8]) -> Result<(), SessionStoreError>;
    fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError>;
    fn write(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError>;
    /// Removing a missing record is not an error.
    fn remove(&self, namespace: &str, key: &str) -> Result<(), SessionStoreError>;
    /// Sorted keys; an unknown namespace yields an empty list.
    fn keys(&self, namespace: &str) -> Result<Vec<String>, SessionStoreError>;
    fn namespaces(&self) -> Result<Vec<String>, SessionStoreError>;
    fn entry_size(&self, namespace: &str, key: &str) -> Result<Option<u64>, SessionStoreError>;
    /// Bytes used by the whole project, metadata included.
    fn total_size(&self) -> Result<u64, SessionStoreError>;
}
