//! DynamoDB-backed storage.
//!
//! `cache_name` is the table; both logical namespaces share it, split by a
//! `namespace` partition key with the cache key as sort key. DynamoDB caps
//! items at 400 KB, so oversized values are skipped with a warning instead
//! of failing the write.

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use futures::stream::BoxStream;
use tracing::warn;

use crate::error::Error;

use super::{Storage, stream_snapshot};

const PARTITION_ATTR: &str = "namespace";
const SORT_ATTR: &str = "cache_key";
const VALUE_ATTR: &str = "value";

/// The DynamoDB item ceiling. Values close to it still carry key and
/// attribute-name overhead, so the usable payload is slightly smaller.
pub const MAX_ITEM_BYTES: usize = 400 * 1024;

#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
    table: String,
    namespace: String,
}

impl DynamoStore {
    /// Connect using ambient AWS configuration (environment, profile, or
    /// instance role).
    pub async fn open(table: &str, namespace: &str) -> Result<Self, Error> {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Ok(Self::with_client(Client::new(&config), table, namespace))
    }

    pub fn with_client(client: Client, table: &str, namespace: &str) -> Self {
        Self {
            client,
            table: table.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// The other namespace in the same table, on the same client.
    pub fn sibling(&self, namespace: &str) -> Self {
        Self::with_client(self.client.clone(), &self.table, namespace)
    }

    async fn query_items(
        &self,
        projection: &str,
    ) -> Result<Vec<std::collections::HashMap<String, AttributeValue>>, Error> {
        // Attribute names go through aliases; "value" is a reserved word.
        let mut pages = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("#ns = :ns")
            .expression_attribute_names("#ns", PARTITION_ATTR)
            .expression_attribute_names("#attr", projection)
            .expression_attribute_values(":ns", AttributeValue::S(self.namespace.clone()))
            .projection_expression("#attr")
            .into_paginator()
            .items()
            .send();
        let mut items = Vec::new();
        while let Some(item) = pages.next().await {
            items.push(item.map_err(Error::backend)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl Storage for DynamoStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(PARTITION_ATTR, AttributeValue::S(self.namespace.clone()))
            .key(SORT_ATTR, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(Error::backend)?;
        Ok(output
            .item()
            .and_then(|item| item.get(VALUE_ATTR))
            .and_then(|attr| attr.as_b().ok())
            .map(|blob| blob.clone().into_inner()))
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        if value.len() > MAX_ITEM_BYTES {
            let err = Error::OversizedItem {
                size: value.len(),
                limit: MAX_ITEM_BYTES,
            };
            warn!(key, error = %err, "skipping oversized cache entry");
            return Ok(());
        }
        self.client
            .put_item()
            .table_name(&self.table)
            .item(PARTITION_ATTR, AttributeValue::S(self.namespace.clone()))
            .item(SORT_ATTR, AttributeValue::S(key.to_string()))
            .item(VALUE_ATTR, AttributeValue::B(Blob::new(value)))
            .send()
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key(PARTITION_ATTR, AttributeValue::S(self.namespace.clone()))
            .key(SORT_ATTR, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    fn keys(&self) -> BoxStream<'_, Result<String, Error>> {
        let store = self.clone();
        stream_snapshot(async move {
            let items = store.query_items(SORT_ATTR).await?;
            Ok(items
                .into_iter()
                .filter_map(|item| {
                    item.get(SORT_ATTR)
                        .and_then(|attr| attr.as_s().ok())
                        .cloned()
                })
                .collect())
        })
    }

    fn values(&self) -> BoxStream<'_, Result<Vec<u8>, Error>> {
        let store = self.clone();
        stream_snapshot(async move {
            let items = store.query_items(VALUE_ATTR).await?;
            Ok(items
                .into_iter()
                .filter_map(|item| {
                    item.get(VALUE_ATTR)
                        .and_then(|attr| attr.as_b().ok())
                        .map(|blob| blob.clone().into_inner())
                })
                .collect())
        })
    }

    async fn clear(&self) -> Result<(), Error> {
        let items = self.query_items(SORT_ATTR).await?;
        for item in items {
            if let Some(key) = item.get(SORT_ATTR).and_then(|attr| attr.as_s().ok()) {
                self.delete(key).await?;
            }
        }
        Ok(())
    }
}
