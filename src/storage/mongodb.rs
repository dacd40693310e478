//! MongoDB-backed storage.
//!
//! `cache_name` selects the database; each namespace is a collection of
//! `{_id: <key>, data: <bytes>}` documents. `GridFsStore` keeps payloads in
//! a GridFS bucket instead, for bodies past the 16 MB document limit.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncReadExt, AsyncWriteExt, TryStreamExt};
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson, Document, doc};
use mongodb::{Client, Collection};

use crate::error::Error;

use super::{Storage, stream_snapshot};

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: String,
    collection: Collection<Document>,
}

impl MongoStore {
    pub async fn open(uri: &str, cache_name: &str, namespace: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri).await.map_err(Error::backend)?;
        Ok(Self::with_client(client, cache_name, namespace))
    }

    pub fn with_client(client: Client, cache_name: &str, namespace: &str) -> Self {
        let collection = client.database(cache_name).collection::<Document>(namespace);
        Self {
            client,
            database: cache_name.to_string(),
            collection,
        }
    }

    /// Another namespace in the same database, on the same client pool.
    pub fn sibling(&self, namespace: &str) -> Self {
        Self::with_client(self.client.clone(), &self.database, namespace)
    }
}

fn binary(value: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: value,
    }
}

#[async_trait]
impl Storage for MongoStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let document = self
            .collection
            .find_one(doc! {"_id": key})
            .await
            .map_err(Error::backend)?;
        match document {
            Some(document) => {
                let bytes = document
                    .get_binary_generic("data")
                    .map_err(|err| Error::Serialization(err.to_string()))?;
                Ok(Some(bytes.clone()))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.collection
            .replace_one(doc! {"_id": key}, doc! {"_id": key, "data": binary(value)})
            .upsert(true)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.collection
            .delete_one(doc! {"_id": key})
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = self
            .collection
            .delete_many(doc! {"_id": {"$in": keys}})
            .await
            .map_err(Error::backend)?;
        Ok(result.deleted_count as usize)
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        let count = self
            .collection
            .count_documents(doc! {"_id": key})
            .await
            .map_err(Error::backend)?;
        Ok(count > 0)
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let collection = self.collection.clone();
        stream_snapshot(async move {
            let documents: Vec<Document> = collection
                .find(doc! {})
                .projection(doc! {"_id": 1})
                .await
                .map_err(Error::backend)?
                .try_collect()
                .await
                .map_err(Error::backend)?;
            Ok(documents
                .into_iter()
                .filter_map(|document| document.get_str("_id").ok().map(str::to_string))
                .collect())
        })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let collection = self.collection.clone();
        stream_snapshot(async move {
            let documents: Vec<Document> = collection
                .find(doc! {})
                .await
                .map_err(Error::backend)?
                .try_collect()
                .await
                .map_err(Error::backend)?;
            Ok(documents
                .into_iter()
                .filter_map(|document| document.get_binary_generic("data").ok().cloned())
                .collect())
        })
    }

    async fn size(&self) -> Result<usize, Error> {
        let count = self
            .collection
            .count_documents(doc! {})
            .await
            .map_err(Error::backend)?;
        Ok(count as usize)
    }

    async fn clear(&self) -> Result<(), Error> {
        self.collection
            .delete_many(doc! {})
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
}

/// Stores each value as a GridFS file named after the cache key.
#[derive(Clone)]
pub struct GridFsStore {
    bucket: mongodb::gridfs::GridFsBucket,
}

impl GridFsStore {
    pub async fn open(uri: &str, cache_name: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri).await.map_err(Error::backend)?;
        Ok(Self::with_client(client, cache_name))
    }

    pub fn with_client(client: Client, cache_name: &str) -> Self {
        let bucket = client.database(cache_name).gridfs_bucket(None);
        Self { bucket }
    }

    async fn file_ids(&self, key: Option<&str>) -> Result<Vec<(Bson, String)>, Error> {
        let filter = match key {
            Some(key) => doc! {"filename": key},
            None => doc! {},
        };
        let files = self
            .bucket
            .find(filter)
            .await
            .map_err(Error::backend)?
            .try_collect::<Vec<_>>()
            .await
            .map_err(Error::backend)?;
        Ok(files
            .into_iter()
            .map(|file| (file.id, file.filename.unwrap_or_default()))
            .collect())
    }
}

#[async_trait]
impl Storage for GridFsStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        if self.file_ids(Some(key)).await?.is_empty() {
            return Ok(None);
        }
        let mut stream = self
            .bucket
            .open_download_stream_by_name(key)
            .await
            .map_err(Error::backend)?;
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .await
            .map_err(Error::backend)?;
        Ok(Some(bytes))
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        // GridFS appends revisions; drop older ones so a read never sees a
        // superseded value.
        self.delete(key).await?;
        let mut stream = self
            .bucket
            .open_upload_stream(key)
            .await
            .map_err(Error::backend)?;
        stream.write_all(&value).await.map_err(Error::backend)?;
        stream.close().await.map_err(Error::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        for (id, _) in self.file_ids(Some(key)).await? {
            self.bucket.delete(id).await.map_err(Error::backend)?;
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(!self.file_ids(Some(key)).await?.is_empty())
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let store = self.clone();
        stream_snapshot(async move {
            let mut keys: Vec<String> = store
                .file_ids(None)
                .await?
                .into_iter()
                .map(|(_, name)| name)
                .collect();
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let store = self.clone();
        stream_snapshot(async move {
            let mut values = Vec::new();
            let mut keys: Vec<String> = store
                .file_ids(None)
                .await?
                .into_iter()
                .map(|(_, name)| name)
                .collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                if let Some(value) = store.read(&key).await? {
                    values.push(value);
                }
            }
            Ok(values)
        })
    }

    async fn size(&self) -> Result<usize, Error> {
        Ok(self.file_ids(None).await?.len())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.bucket.drop().await.map_err(Error::backend)
    }
}
