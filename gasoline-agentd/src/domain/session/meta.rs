use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// First 16 hex chars of the SHA-256 of the absolute project path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub const LEN: usize = 16;

    pub fn for_path(project_path: &Path) -> Self {
        let digest = Sha256::digest(project_path.to_string_lossy().as_bytes());
        let mut encoded = hex::encode(digest);
        encoded.truncate(Self::LEN);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub project_id: ProjectId,
    pub project_path: String,
    pub session_count: u64,
    pub first_created: DateTime<Utc>,
    pub last_session: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<DateTime<Utc>>,
}

impl SessionMeta {
    pub fn fresh(project_id: ProjectId, project_path: &Path, now: DateTime<Utc>) -> Self {
        Self {
            project_id,
            project_path: project_path.to_string_lossy().into_owned(),
            session_count: 1,
            first_created: now,
            last_session: now,
            last_access: None,
        }
    }

    /// Records a new open of an existing project.
    pub fn reopened(mut self, now: DateTime<Utc>) -> Self {
        self.session_count += 1;
        self.last_session = now;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    #[test]
    fn hash_is_sixteen_lowercase_hex_chars() {
        let id = ProjectId::for_path(Path::new("/home/dev/project"));
        assert_eq!(id.as_str().len(), ProjectId::LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn reopen_increments_count() {
        let now = Utc::now();
        let path = Path::new("/tmp/p");
        let meta = SessionMeta::fresh(ProjectId::for_path(path), path, now);
        assert_eq!(meta.session_count, 1);
        let meta = meta.reopened(now);
        assert_eq!(meta.session_count, 2);
        assert_eq!(meta.first_created, now);
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(a in "/[a-z]{1,12}(/[a-z0-9]{1,8}){0,3}", b in "/[a-z]{1,12}(/[a-z0-9]{1,8}){0,3}") {
            let first = ProjectId::for_path(&PathBuf::from(&a));
            prop_assert_eq!(first.clone(), ProjectId::for_path(&PathBuf::from(&a)));
            prop_assert_eq!(first.as_str().len(), 16);
            if a != b {
                prop_assert_ne!(first, ProjectId::for_path(&PathBuf::from(&b)));
            }
        }
    }
}
