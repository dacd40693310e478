//! The pluggable storage contract and the bundled backends.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::Error;

pub mod filesystem;
pub mod memory;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// An async key–value namespace.
///
/// The cache owns two instances per backend, one for serialized responses and
/// one for redirect aliases. Implementations must tolerate concurrent calls
/// from one task set and must write whole values only; a reader never
/// observes a partially written entry.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Read the value stored under `key`, if any. No side effects.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Store `value` under `key`, replacing any existing value.
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Remove `key`. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Remove every key in `keys`, returning how many were requested gone.
    /// Backends with a native batch primitive should override this.
    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.read(key).await?.is_some())
    }

    /// All keys in this namespace, snapshot-consistent at best effort.
    fn keys(&self) -> BoxStream<'_, Result<String, Error>>;

    /// All values in this namespace, logically paired with `keys`.
    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>>;

    /// Entry count; approximate for eventually-consistent backends.
    async fn size(&self) -> Result<usize, Error> {
        let mut keys = self.keys();
        let mut count = 0;
        while let Some(key) = keys.next().await {
            key?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove all entries in this namespace.
    async fn clear(&self) -> Result<(), Error>;

    /// Release any underlying connections. Idempotent.
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Adapt a one-shot listing future into the stream shape `keys`/`values`
/// require; backends without native cursors collect a snapshot and stream it.
pub(crate) fn stream_snapshot<T, F>(fut: F) -> BoxStream<'static, Result<T, Error>>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<Vec<T>, Error>> + Send + 'static,
{
    futures::stream::once(fut)
        .map(|result| match result {
            Ok(items) => futures::stream::iter(items.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(err) => futures::stream::iter(vec![Err(err)]),
        })
        .flatten()
        .boxed()
}
