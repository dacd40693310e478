//! SQLite-backed storage.
//!
//! One database file carries both cache namespaces as separate tables. All
//! statements run on a single `tokio_rusqlite::Connection`, whose command
//! loop serializes access, so concurrent callers share one file handle
//! without extra locking.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{OptionalExtension, params};

use crate::error::Error;

use super::{Storage, stream_snapshot};

#[derive(Debug, Clone, Default)]
pub struct SqliteOptions {
    /// Trade durability for write speed (`PRAGMA synchronous=OFF`). A crash
    /// can lose recent writes but cannot corrupt committed ones.
    pub fast_save: bool,
}

/// Open the cache database, creating parent directories and applying
/// pragmas. A leading `~` in the path expands to the user's home directory.
pub async fn connect(path: impl AsRef<Path>, options: &SqliteOptions) -> Result<Connection, Error> {
    let path = expand_user(path.as_ref());
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let conn = Connection::open(&path).await.map_err(Error::backend)?;
    let synchronous = if options.fast_save { "OFF" } else { "NORMAL" };
    let pragmas = format!(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous={synchronous};"
    );
    conn.call(move |conn| {
        conn.execute_batch(&pragmas)?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await
    .map_err(Error::backend)?;
    Ok(conn)
}

fn expand_user(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    path.to_path_buf()
}

/// One namespace, backed by a `(key TEXT PRIMARY KEY, value BLOB)` table.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    table: String,
}

impl SqliteStore {
    /// Create the namespace table on a shared connection.
    pub async fn attach(conn: Connection, table: &str) -> Result<Self, Error> {
        if table.is_empty()
            || !table
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(Error::backend(format!("invalid table name '{table}'")));
        }
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, value BLOB NOT NULL)"
        );
        conn.call(move |conn| {
            conn.execute(&create, [])?;
            Ok::<(), tokio_rusqlite::rusqlite::Error>(())
        })
        .await
        .map_err(Error::backend)?;
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    /// Open a standalone store with its own connection.
    pub async fn open(
        path: impl AsRef<Path>,
        table: &str,
        options: &SqliteOptions,
    ) -> Result<Self, Error> {
        let conn = connect(path, options).await?;
        Self::attach(conn, table).await
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let key = key.to_string();
        let sql = format!("SELECT value FROM {} WHERE key = ?1", self.table);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let value = stmt
                    .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
                    .optional()?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(value)
            })
            .await
            .map_err(Error::backend)
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let key = key.to_string();
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            self.table
        );
        self.conn
            .call(move |conn| {
                conn.prepare_cached(&sql)?.execute(params![key, value])?;
                Ok::<(), tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(Error::backend)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let key = key.to_string();
        let sql = format!("DELETE FROM {} WHERE key = ?1", self.table);
        self.conn
            .call(move |conn| {
                conn.prepare_cached(&sql)?.execute(params![key])?;
                Ok::<(), tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(Error::backend)
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        let keys = keys.to_vec();
        let sql = format!("DELETE FROM {} WHERE key = ?1", self.table);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for key in &keys {
                    tx.prepare_cached(&sql)?.execute(params![key])?;
                }
                tx.commit()?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(keys.len())
            })
            .await
            .map_err(Error::backend)
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        let sql = format!("SELECT 1 FROM {} WHERE key = ?1", self.table);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let found = stmt.query_row(params![key], |_| Ok(())).optional()?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(found.is_some())
            })
            .await
            .map_err(Error::backend)
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let conn = self.conn.clone();
        let sql = format!("SELECT key FROM {}", self.table);
        stream_snapshot(async move {
            conn.call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let keys = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(keys)
            })
            .await
            .map_err(Error::backend)
        })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let conn = self.conn.clone();
        let sql = format!("SELECT value FROM {}", self.table);
        stream_snapshot(async move {
            conn.call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let values = stmt
                    .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(values)
            })
            .await
            .map_err(Error::backend)
        })
    }

    async fn size(&self) -> Result<usize, Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        self.conn
            .call(move |conn| {
                let count = conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(count as usize)
            })
            .await
            .map_err(Error::backend)
    }

    async fn clear(&self) -> Result<(), Error> {
        let sql = format!("DELETE FROM {}", self.table);
        self.conn
            .call(move |conn| {
                conn.execute(&sql, [])?;
                Ok::<(), tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(Error::backend)
    }

    async fn close(&self) -> Result<(), Error> {
        // Another namespace may share this connection; closing twice reports
        // a closed channel, which callers can ignore safely.
        let _ = self.conn.clone().close().await;
        Ok(())
    }
}
