use anyhow::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::ObjectStore;

/// In-process store backed by a sorted map. Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with the given objects.
    pub fn with_objects<K, B>(objects: impl IntoIterator<Item = (K, B)>) -> Self
    where
        K: Into<String>,
        B: Into<Bytes>,
    {
        let store = Self::new();
        for (key, body) in objects {
            store.insert(key, body);
        }
        store
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Bytes>) {
        self.lock().insert(key.into(), body.into());
    }

    /// Snapshot of every key currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bytes>> {
        // A poisoned map is still structurally valid.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        self.lock().insert(key.to_string(), body);
        Ok(())
    }
}
