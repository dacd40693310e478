//! The cache facade: two storage namespaces plus the caching policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use http::Method;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache_control::CacheDecision;
use crate::error::Error;
use crate::expire::{ExpireAfter, ResolvedExpiration, UrlPattern};
use crate::key::{self, KeyOptions};
use crate::request::{Body, Request};
use crate::response::{CachedResponse, RequestRecord};
use crate::serialize::Serializer;
use crate::storage::Storage;
use crate::storage::filesystem::FileStore;
use crate::storage::memory::MemoryStore;

/// Response predicate applied before a write; `false` vetoes the store.
#[derive(Clone)]
pub enum Filter {
    Sync(Arc<dyn Fn(&CachedResponse) -> bool + Send + Sync>),
    Async(Arc<dyn for<'a> Fn(&'a CachedResponse) -> BoxFuture<'a, bool> + Send + Sync>),
}

impl Filter {
    async fn accepts(&self, response: &CachedResponse) -> bool {
        match self {
            Filter::Sync(f) => f(response),
            Filter::Async(f) => f(response).await,
        }
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Sync(_) => f.write_str("Filter::Sync"),
            Filter::Async(_) => f.write_str("Filter::Async"),
        }
    }
}

/// Caching policy shared by the facade and the session.
///
/// Construction is the one place configuration errors surface: URL patterns
/// compile eagerly and a malformed one fails the build.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub(crate) expire_after: ExpireAfter,
    pub(crate) urls_expire_after: Vec<(UrlPattern, ExpireAfter)>,
    pub(crate) allowed_codes: HashSet<u16>,
    pub(crate) allowed_methods: HashSet<String>,
    pub(crate) include_headers: bool,
    pub(crate) ignored_params: Vec<String>,
    pub(crate) cache_control: bool,
    pub(crate) stale_if_error: bool,
    pub(crate) filter: Option<Filter>,
    pub(crate) secret_key: Option<Vec<u8>>,
    pub(crate) autoclose: Option<bool>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expire_after: ExpireAfter::Never,
            urls_expire_after: Vec::new(),
            allowed_codes: HashSet::from([200]),
            allowed_methods: HashSet::from(["GET".to_string(), "HEAD".to_string()]),
            include_headers: false,
            ignored_params: Vec::new(),
            cache_control: false,
            stale_if_error: false,
            filter: None,
            secret_key: None,
            autoclose: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default expiration for responses nothing more specific applies to.
    pub fn expire_after(mut self, expire_after: impl Into<ExpireAfter>) -> Self {
        self.expire_after = expire_after.into();
        self
    }

    /// Add a URL pattern with its own expiration. Patterns are checked in
    /// the order they were added; the first match wins.
    pub fn url_expire_after(
        mut self,
        pattern: &str,
        expire_after: impl Into<ExpireAfter>,
    ) -> Result<Self, Error> {
        let compiled = UrlPattern::compile(pattern)?;
        self.urls_expire_after.push((compiled, expire_after.into()));
        Ok(self)
    }

    /// Status codes eligible for caching. Defaults to 200 only.
    pub fn allowed_codes(mut self, codes: &[u16]) -> Self {
        self.allowed_codes = codes.iter().copied().collect();
        self
    }

    /// Methods eligible for caching, compared case-insensitively. Defaults
    /// to GET and HEAD.
    pub fn allowed_methods(mut self, methods: &[&str]) -> Self {
        self.allowed_methods = methods.iter().map(|m| m.to_uppercase()).collect();
        self
    }

    /// Fold request headers into the cache key.
    pub fn include_headers(mut self, include: bool) -> Self {
        self.include_headers = include;
        self
    }

    /// Query parameters, body fields, and headers excluded from the key.
    pub fn ignored_params(mut self, params: &[&str]) -> Self {
        self.ignored_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Honor request and response `Cache-Control` headers.
    pub fn cache_control(mut self, enabled: bool) -> Self {
        self.cache_control = enabled;
        self
    }

    /// Serve a stale cached response when the network fetch fails.
    pub fn stale_if_error(mut self, enabled: bool) -> Self {
        self.stale_if_error = enabled;
        self
    }

    pub fn filter_fn(mut self, f: impl Fn(&CachedResponse) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Filter::Sync(Arc::new(f)));
        self
    }

    pub fn async_filter_fn(
        mut self,
        f: impl for<'a> Fn(&'a CachedResponse) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Filter::Async(Arc::new(f)));
        self
    }

    /// Sign stored entries; reads reject tampered or foreign bytes.
    pub fn secret_key(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.secret_key = Some(secret.as_ref().to_vec());
        self
    }

    /// Close backend connections when the session closes. Defaults to true
    /// for file-backed stores and false for networked ones.
    pub fn autoclose(mut self, autoclose: bool) -> Self {
        self.autoclose = Some(autoclose);
        self
    }

    fn key_options(&self) -> KeyOptions<'_> {
        KeyOptions {
            include_headers: self.include_headers,
            ignored_params: &self.ignored_params,
        }
    }
}

/// Two storage namespaces — serialized responses and redirect aliases —
/// behind the caching policy.
///
/// Every failure on the read path degrades to a miss; the only errors
/// callers see are from explicit maintenance operations.
pub struct CacheBackend {
    responses: Arc<dyn Storage>,
    redirects: Arc<dyn Storage>,
    config: RwLock<CacheConfig>,
    serializer: Serializer,
    autoclose: bool,
}

impl CacheBackend {
    /// Assemble a backend from caller-provided storage, e.g. a custom
    /// `Storage` implementation.
    pub fn with_stores(
        responses: Arc<dyn Storage>,
        redirects: Arc<dyn Storage>,
        config: CacheConfig,
        autoclose_default: bool,
    ) -> Self {
        let serializer = match &config.secret_key {
            Some(secret) => Serializer::signed(secret),
            None => Serializer::plain(),
        };
        let autoclose = config.autoclose.unwrap_or(autoclose_default);
        Self {
            responses,
            redirects,
            config: RwLock::new(config),
            serializer,
            autoclose,
        }
    }

    /// Process-local backend.
    pub fn memory(config: CacheConfig) -> Self {
        Self::with_stores(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            config,
            true,
        )
    }

    /// Filesystem backend: one file per response under
    /// `<dir>/responses/`, with redirect aliases indexed under
    /// `<dir>/redirects/`.
    pub async fn filesystem(
        dir: impl Into<std::path::PathBuf>,
        config: CacheConfig,
    ) -> Result<Self, Error> {
        let dir = dir.into();
        let responses = FileStore::open(dir.join("responses")).await?;
        let redirects = FileStore::open(dir.join("redirects")).await?;
        Ok(Self::with_stores(
            Arc::new(responses),
            Arc::new(redirects),
            config,
            true,
        ))
    }

    /// SQLite backend: both namespaces as tables in one database file.
    #[cfg(feature = "sqlite")]
    pub async fn sqlite(
        path: impl AsRef<std::path::Path>,
        options: crate::storage::sqlite::SqliteOptions,
        config: CacheConfig,
    ) -> Result<Self, Error> {
        use crate::storage::sqlite::{SqliteStore, connect};
        let conn = connect(path, &options).await?;
        let responses = SqliteStore::attach(conn.clone(), "responses").await?;
        let redirects = SqliteStore::attach(conn, "redirects").await?;
        Ok(Self::with_stores(
            Arc::new(responses),
            Arc::new(redirects),
            config,
            true,
        ))
    }

    /// Redis backend: entries live under `<cache_name>:<namespace>:<key>`.
    #[cfg(feature = "redis")]
    pub async fn redis(url: &str, cache_name: &str, config: CacheConfig) -> Result<Self, Error> {
        use crate::storage::redis::RedisStore;
        let responses = RedisStore::open(url, cache_name, "responses").await?;
        let redirects = responses.sibling("redirects");
        Ok(Self::with_stores(
            Arc::new(responses),
            Arc::new(redirects),
            config,
            false,
        ))
    }

    /// MongoDB backend: `cache_name` is the database, one collection per
    /// namespace.
    #[cfg(feature = "mongodb")]
    pub async fn mongodb(uri: &str, cache_name: &str, config: CacheConfig) -> Result<Self, Error> {
        use crate::storage::mongodb::MongoStore;
        let responses = MongoStore::open(uri, cache_name, "responses").await?;
        let redirects = responses.sibling("redirects");
        Ok(Self::with_stores(
            Arc::new(responses),
            Arc::new(redirects),
            config,
            false,
        ))
    }

    /// MongoDB with response payloads in GridFS, for bodies past the
    /// document size limit. Redirect aliases stay in a regular collection.
    #[cfg(feature = "mongodb")]
    pub async fn gridfs(uri: &str, cache_name: &str, config: CacheConfig) -> Result<Self, Error> {
        use crate::storage::mongodb::{GridFsStore, MongoStore};
        let responses = GridFsStore::open(uri, cache_name).await?;
        let redirects = MongoStore::open(uri, cache_name, "redirects").await?;
        Ok(Self::with_stores(
            Arc::new(responses),
            Arc::new(redirects),
            config,
            false,
        ))
    }

    /// DynamoDB backend: `cache_name` is the table; both namespaces share
    /// it, split by partition key.
    #[cfg(feature = "dynamodb")]
    pub async fn dynamodb(cache_name: &str, config: CacheConfig) -> Result<Self, Error> {
        use crate::storage::dynamodb::DynamoStore;
        let responses = DynamoStore::open(cache_name, "responses").await?;
        let redirects = responses.sibling("redirects");
        Ok(Self::with_stores(
            Arc::new(responses),
            Arc::new(redirects),
            config,
            false,
        ))
    }

    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Swap the default expiration at runtime; in-flight requests keep the
    /// snapshot they started with.
    pub fn set_expire_after(&self, expire_after: impl Into<ExpireAfter>) {
        self.config.write().expire_after = expire_after.into();
    }

    pub(crate) fn autoclose(&self) -> bool {
        self.autoclose
    }

    /// Derive the cache key for a request under the current configuration.
    pub fn create_key(&self, request: &Request) -> String {
        let config = self.config.read();
        key::create_key(
            &request.method,
            &request.url,
            &request.body,
            &request.headers,
            &config.key_options(),
        )
    }

    /// Fetch and deserialize the response stored under `key`, following one
    /// redirect alias if present. Read failures of any kind surface as a
    /// miss.
    pub async fn get_response(&self, key: &str) -> Option<CachedResponse> {
        match self.try_get_response(key).await {
            Ok(response) => response,
            Err(Error::Integrity) => {
                warn!(key, "cached entry failed signature verification; treating as miss");
                None
            }
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn try_get_response(&self, key: &str) -> Result<Option<CachedResponse>, Error> {
        let target = match self.redirects.read(key).await? {
            Some(bytes) => Some(String::from_utf8(bytes).map_err(|err| {
                Error::Serialization(format!("redirect target is not valid UTF-8: {err}"))
            })?),
            None => None,
        };
        let key = target.as_deref().unwrap_or(key);

        match self.responses.read(key).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize and store a response, and alias each redirect in its
    /// history to the same entry.
    pub async fn save_response(&self, key: &str, response: &CachedResponse) -> Result<(), Error> {
        let bytes = self.serializer.serialize(response)?;
        self.responses.write(key, bytes).await?;

        let options = self.config();
        for entry in &response.history {
            let alias = record_key(&entry.request, &options);
            if alias != key {
                self.redirects.write(&alias, key.as_bytes().to_vec()).await?;
            }
        }
        Ok(())
    }

    /// The storage key of a snapshot's final exchange, for responses that
    /// arrived through redirects.
    pub(crate) fn response_key(&self, response: &CachedResponse) -> String {
        let config = self.config.read();
        key::create_key(
            &response.method,
            &response.url,
            &record_body(&response.request),
            &response.request.headers,
            &config.key_options(),
        )
    }

    /// Remove a response and any redirect aliases pointing at it. A key that
    /// names an alias removes the alias target.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        let target = match self.redirects.read(key).await {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
            _ => None,
        };
        let primary = target.as_deref().unwrap_or(key);

        if let Ok(Some(bytes)) = self.responses.read(primary).await
            && let Ok(response) = self.serializer.deserialize(&bytes)
        {
            let config = self.config();
            for entry in &response.history {
                self.redirects.delete(&record_key(&entry.request, &config)).await?;
            }
        }
        self.redirects.delete(key).await?;
        self.responses.delete(primary).await
    }

    pub async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        let count = self.responses.bulk_delete(keys).await?;
        self.redirects.bulk_delete(keys).await?;
        Ok(count)
    }

    /// Derive the key for `method`/`url` and delete its entry.
    pub async fn delete_url(&self, method: Method, url: &str) -> Result<(), Error> {
        let request = Request::new(method, url)?;
        let key = self.create_key(&request);
        self.delete(&key).await
    }

    pub async fn has_url(&self, method: Method, url: &str) -> Result<bool, Error> {
        let request = Request::new(method, url)?;
        let key = self.create_key(&request);
        if self.responses.contains(&key).await? {
            return Ok(true);
        }
        self.redirects.contains(&key).await
    }

    /// The request URLs of all stored responses. Unreadable entries are
    /// skipped.
    pub fn get_urls(&self) -> BoxStream<'static, String> {
        let responses = Arc::clone(&self.responses);
        let serializer = self.serializer.clone();
        futures::stream::once(async move {
            let mut urls = Vec::new();
            let mut values = responses.values();
            while let Some(value) = values.next().await {
                match value {
                    Ok(bytes) => {
                        if let Ok(response) = serializer.deserialize(&bytes) {
                            urls.push(response.url.to_string());
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable cache entry");
                    }
                }
            }
            futures::stream::iter(urls)
        })
        .flatten()
        .boxed()
    }

    /// Drop expired and unreadable responses. With `new_expire_after`, the
    /// surviving entries are re-stamped with that window. Redirect aliases
    /// whose target disappeared are swept in the same pass.
    pub async fn delete_expired_responses(
        &self,
        new_expire_after: Option<ExpireAfter>,
    ) -> Result<usize, Error> {
        let mut keys = Vec::new();
        let mut key_stream = self.responses.keys();
        while let Some(key) = key_stream.next().await {
            keys.push(key?);
        }
        drop(key_stream);

        let now = SystemTime::now();
        let mut expired = Vec::new();
        for key in keys {
            match self.responses.read(&key).await {
                Ok(Some(bytes)) => match self.serializer.deserialize(&bytes) {
                    Ok(mut response) => {
                        if response.is_expired_at(now) {
                            expired.push(key);
                        } else if let Some(window) = new_expire_after {
                            match window.resolve(now) {
                                ResolvedExpiration::SkipStore => expired.push(key),
                                resolved => {
                                    response.expires = resolved.instant();
                                    self.save_response(&key, &response).await?;
                                }
                            }
                        }
                    }
                    // Unreadable entries count as expired.
                    Err(_) => expired.push(key),
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(key, error = %err, "skipping entry during expiration sweep");
                }
            }
        }

        debug!(count = expired.len(), "deleting expired cache entries");
        self.responses.bulk_delete(&expired).await?;

        // Cascade: drop aliases whose target is gone.
        let mut dangling = Vec::new();
        let mut alias_stream = self.redirects.keys();
        let mut aliases = Vec::new();
        while let Some(alias) = alias_stream.next().await {
            aliases.push(alias?);
        }
        drop(alias_stream);
        for alias in aliases {
            match self.redirects.read(&alias).await {
                Ok(Some(bytes)) => {
                    let target = String::from_utf8_lossy(&bytes).into_owned();
                    if !self.responses.contains(&target).await.unwrap_or(false) {
                        dangling.push(alias);
                    }
                }
                Ok(None) => {}
                Err(_) => dangling.push(alias),
            }
        }
        self.redirects.bulk_delete(&dangling).await?;

        Ok(expired.len())
    }

    /// Clear both namespaces.
    pub async fn clear(&self) -> Result<(), Error> {
        self.responses.clear().await?;
        self.redirects.clear().await
    }

    /// Whether a response passes every storage gate: allowed method and
    /// status, the response filter, Cache-Control, and a non-immediate
    /// expiration.
    pub async fn is_cacheable(&self, response: &CachedResponse) -> bool {
        let config = self.config();
        let mut decision = CacheDecision::new(
            config.cache_control,
            config.expire_after,
            &config.urls_expire_after,
            &response.url,
            &response.request.headers,
            None,
            false,
        );
        decision.update_from_response(config.cache_control, &response.headers);
        self.check_cacheable(response, &decision, &config).await
    }

    pub(crate) async fn check_cacheable(
        &self,
        response: &CachedResponse,
        decision: &CacheDecision,
        config: &CacheConfig,
    ) -> bool {
        if !config
            .allowed_methods
            .contains(&response.request.method.as_str().to_uppercase())
        {
            return false;
        }
        if !config.allowed_codes.contains(&response.status.as_u16()) {
            return false;
        }
        if decision.skip_store(SystemTime::now()) {
            return false;
        }
        if let Some(filter) = &config.filter
            && !filter.accepts(response).await
        {
            return false;
        }
        true
    }

    /// Release backend connections.
    pub async fn close(&self) -> Result<(), Error> {
        self.responses.close().await?;
        self.redirects.close().await
    }
}

fn record_body(record: &RequestRecord) -> Body {
    match &record.body {
        Some(bytes) => Body::Bytes(bytes.clone()),
        None => Body::None,
    }
}

/// The key a fresh request matching this record would derive, used for
/// redirect aliases.
fn record_key(record: &RequestRecord, config: &CacheConfig) -> String {
    key::create_key(
        &record.method,
        &record.url,
        &record_body(record),
        &record.headers,
        &config.key_options(),
    )
}
