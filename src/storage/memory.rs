//! Process-local storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;

use crate::error::Error;

use super::{Storage, stream_snapshot};

/// An in-memory namespace. Cloning shares the underlying map, so a session
/// and a facade handle observe the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
        Ok(keys.len())
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.entries.read().contains_key(key))
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let keys: Vec<String> = self.entries.read().keys().cloned().collect();
        stream_snapshot(async move { Ok(keys) })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let values: Vec<Vec<u8>> = self.entries.read().values().cloned().collect();
        stream_snapshot(async move { Ok(values) })
    }

    async fn size(&self) -> Result<usize, Error> {
        Ok(self.entries.read().len())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.entries.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn write_read_delete() {
        let store = MemoryStore::new();
        store.write("a", b"one".to_vec()).await.unwrap();
        assert_eq!(store.read("a").await.unwrap(), Some(b"one".to_vec()));
        assert!(store.contains("a").await.unwrap());

        store.write("a", b"two".to_vec()).await.unwrap();
        assert_eq!(store.read("a").await.unwrap(), Some(b"two".to_vec()));

        store.delete("a").await.unwrap();
        assert_eq!(store.read("a").await.unwrap(), None);
        // Deleting an absent key is a no-op.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn keys_and_size() {
        let store = MemoryStore::new();
        store.write("a", b"1".to_vec()).await.unwrap();
        store.write("b", b"2".to_vec()).await.unwrap();
        let mut keys: Vec<String> = store.keys().try_collect().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.size().await.unwrap(), 2);

        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }
}
