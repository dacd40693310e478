//! One file per key on the local filesystem.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

use crate::error::Error;

use super::{Storage, stream_snapshot};

const TEMP_PREFIX: &str = "tmp_";

/// Stores each entry as `<dir>/<key>`. Writes go to a `tmp_`-prefixed
/// sibling first and are renamed into place, so a concurrent reader sees
/// either the old value or the new one, never a torn file.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create) the namespace directory. Leftover temp files from
    /// an interrupted run are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        async_fs::create_dir_all(&dir).await?;
        let store = Self { dir };
        store.remove_temp_files().await;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, Error> {
        if key.is_empty()
            || !key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
            || key.chars().all(|ch| ch == '.')
            || key.starts_with(TEMP_PREFIX)
        {
            return Err(Error::backend(format!("key '{key}' is not a valid file name")));
        }
        Ok(self.dir.join(key))
    }

    async fn remove_temp_files(&self) {
        let mut entries = match async_fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false)
            {
                let _ = async_fs::remove_file(entry.path()).await;
            }
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        let mut entries = match async_fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && !name.starts_with(TEMP_PREFIX)
            {
                keys.push(name.to_string());
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.entry_path(key)?;
        match async_fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let path = self.entry_path(key)?;
        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{key}"));
        let mut file = async_fs::File::create(&temp_path).await?;
        file.write_all(&value).await?;
        file.flush().await?;
        drop(file);
        if let Err(err) = async_fs::rename(&temp_path, &path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let path = self.entry_path(key)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        let path = self.entry_path(key)?;
        Ok(async_fs::try_exists(&path).await.unwrap_or(false))
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let store = self.clone();
        stream_snapshot(async move { store.list_keys().await })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let store = self.clone();
        stream_snapshot(async move {
            let mut values = Vec::new();
            for key in store.list_keys().await? {
                if let Some(value) = store.read(&key).await? {
                    values.push(value);
                }
            }
            Ok(values)
        })
    }

    async fn size(&self) -> Result<usize, Error> {
        Ok(self.list_keys().await?.len())
    }

    async fn clear(&self) -> Result<(), Error> {
        match async_fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        async_fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("responses")).await.unwrap();

        store.write("abc123", b"one".to_vec()).await.unwrap();
        assert_eq!(store.read("abc123").await.unwrap(), Some(b"one".to_vec()));

        store.write("abc123", b"two".to_vec()).await.unwrap();
        assert_eq!(store.read("abc123").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.size().await.unwrap(), 1);

        store.delete("abc123").await.unwrap();
        store.delete("abc123").await.unwrap();
        assert_eq!(store.read("abc123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hostile_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.read("../escape").await.is_err());
        assert!(store.write("a/b", Vec::new()).await.is_err());
        assert!(store.write("", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn clear_resets_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("responses")).await.unwrap();
        store.write("k1", b"v".to_vec()).await.unwrap();
        store.write("k2", b"v".to_vec()).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        // Still usable after clear.
        store.write("k3", b"v".to_vec()).await.unwrap();
        assert!(store.contains("k3").await.unwrap());
    }

    #[tokio::test]
    async fn leftover_temp_files_are_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let ns = dir.path().join("responses");
        tokio::fs::create_dir_all(&ns).await.unwrap();
        tokio::fs::write(ns.join("tmp_partial"), b"torn").await.unwrap();
        let store = FileStore::open(&ns).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        assert!(!ns.join("tmp_partial").exists());
    }
}
