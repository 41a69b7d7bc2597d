use crate::ports::session::{RecordRepository, SessionStoreError};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    meta: Option<Vec<u8>>,
    records: BTreeMap<(String, String), Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct InMemoryRecordRepository {
    inner: Mutex<Inner>,
}

impl InMemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordRepository for InMemoryRecordRepository {
    fn read_meta(&self) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Ok(self.inner.lock().expect("record repo poisoned").meta.clone())
    }

    fn write_meta(&self, bytes: &[u8]) -> Result<(), SessionStoreError> {
        self.inner.lock().expect("record repo poisoned").meta = Some(bytes.to_vec());
        Ok(())
    }

    fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        let inner = self.inner.lock().expect("record repo poisoned");
        Ok(inner
            .records
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn write(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError> {
        let mut inner = self.inner.lock().expect("record repo poisoned");
        inner
            .records
            .insert((namespace.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), SessionStoreError> {
        let mut inner = self.inner.lock().expect("record repo poisoned");
        inner
            .records
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, SessionStoreError> {
        let inner = self.inner.lock().expect("record repo poisoned");
        Ok(inner
            .records
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn namespaces(&self) -> Result<Vec<String>, SessionStoreError> {
        let inner = self.inner.lock().expect("record repo poisoned");
        let mut names: Vec<String> = inner.records.keys().map(|(ns, _)| ns.clone()).collect();
        names.dedup();
        Ok(names)
    }

    fn entry_size(&self, namespace: &str, key: &str) -> Result<Option<u64>, SessionStoreError> {
        let inner = self.inner.lock().expect("record repo poisoned");
        Ok(inner
            .records
            .get(&(namespace.to_string(), key.to_string()))
            .map(|bytes| bytes.len() as u64))
    }

    fn total_size(&self) -> Result<u64, SessionStoreError> {
        let inner = self.inner.lock().expect("record repo poisoned");
        let records: u64 = inner.records.values().map(|bytes| bytes.len() as u64).sum();
        Ok(records + inner.meta.as_ref().map_or(0, |meta| meta.len() as u64))
    }
}
