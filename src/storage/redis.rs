//! Redis-backed storage.
//!
//! `cache_name` becomes a key-prefix namespace: every entry lives under
//! `<cache_name>:<namespace>:<key>`, so several caches can share one server.

use async_trait::async_trait;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::Error;

use super::{Storage, stream_snapshot};

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cache_name: String,
    namespace: String,
}

impl RedisStore {
    pub async fn open(url: &str, cache_name: &str, namespace: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(Error::backend)?;
        let conn = ConnectionManager::new(client).await.map_err(Error::backend)?;
        Ok(Self::with_connection(conn, cache_name, namespace))
    }

    /// Reuse an existing connection, e.g. for the second namespace or a
    /// caller-managed pool.
    pub fn with_connection(conn: ConnectionManager, cache_name: &str, namespace: &str) -> Self {
        Self {
            conn,
            cache_name: cache_name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Another namespace on the same connection.
    pub fn sibling(&self, namespace: &str) -> Self {
        Self::with_connection(self.conn.clone(), &self.cache_name, namespace)
    }

    fn prefix(&self) -> String {
        format!("{}:{}:", self.cache_name, self.namespace)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }

    async fn scan_keys(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let prefix = self.prefix();
        let pattern = format!("{prefix}*");
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(Error::backend)?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            if let Some(stripped) = key.strip_prefix(&prefix) {
                keys.push(stripped.to_string());
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Storage for RedisStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut conn = self.conn.clone();
        conn.get(self.full_key(key)).await.map_err(Error::backend)
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.full_key(key), value)
            .await
            .map_err(Error::backend)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.full_key(key))
            .await
            .map_err(Error::backend)
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let full_keys: Vec<String> = keys.iter().map(|key| self.full_key(key)).collect();
        conn.del::<_, ()>(full_keys).await.map_err(Error::backend)?;
        Ok(keys.len())
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        conn.exists(self.full_key(key)).await.map_err(Error::backend)
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let store = self.clone();
        stream_snapshot(async move { store.scan_keys().await })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let store = self.clone();
        stream_snapshot(async move {
            let mut conn = store.conn.clone();
            let mut values = Vec::new();
            for key in store.scan_keys().await? {
                let value: Option<Vec<u8>> = conn
                    .get(store.full_key(&key))
                    .await
                    .map_err(Error::backend)?;
                if let Some(value) = value {
                    values.push(value);
                }
            }
            Ok(values)
        })
    }

    async fn size(&self) -> Result<usize, Error> {
        Ok(self.scan_keys().await?.len())
    }

    async fn clear(&self) -> Result<(), Error> {
        let keys = self.scan_keys().await?;
        self.bulk_delete(&keys).await?;
        Ok(())
    }

    // The connection manager reconnects on demand and has nothing to
    // release; dropping the last clone tears the connection down.
}
