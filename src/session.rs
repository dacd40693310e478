//! The request interceptor that wraps an HTTP client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::backend::CacheBackend;
use crate::cache_control::CacheDecision;
use crate::error::{BoxError, Error};
use crate::expire::ExpireAfter;
use crate::request::Request;
use crate::response::{CachedResponse, Cookie, RequestRecord};

/// One hop of a redirect chain the client followed.
#[derive(Debug, Clone)]
pub struct TransportHop {
    pub method: Method,
    pub url: Url,
    pub status: StatusCode,
    /// Response headers of this hop.
    pub headers: HeaderMap,
    /// Headers the client actually sent on this hop. They feed the redirect
    /// alias key, so a later identical request resolves the alias even when
    /// headers participate in key derivation.
    pub request_headers: HeaderMap,
    /// Body sent on this hop, when the redirect preserved one.
    pub request_body: Option<Bytes>,
}

/// What the wrapped HTTP client hands back: the final response plus any
/// redirects it followed on the way, oldest first.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub method: Method,
    pub url: Url,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub history: Vec<TransportHop>,
}

/// The seam to the external HTTP client.
///
/// `CachedSession` implements this trait too, so interceptors for auth,
/// retries, or rate limiting can stack above or below the cache.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<TransportResponse, BoxError>;

    /// Called with cookies recovered from a response (cached or fresh) so
    /// the client's jar stays current. The default does nothing.
    fn store_cookies(&self, _url: &Url, _cookies: &[Cookie]) {}
}

/// An HTTP session with a transparent response cache in front of `client`.
pub struct CachedSession<C> {
    client: C,
    cache: CacheBackend,
    disabled_depth: Arc<AtomicUsize>,
}

/// Keeps the cache bypassed until dropped; scopes may nest.
pub struct DisabledGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for DisabledGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<C: HttpClient> CachedSession<C> {
    pub fn new(client: C, cache: CacheBackend) -> Self {
        Self {
            client,
            cache,
            disabled_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn cache(&self) -> &CacheBackend {
        &self.cache
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn get(&self, url: &str) -> RequestBuilder<'_, C> {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder<'_, C> {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder<'_, C> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder<'_, C> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder<'_, C> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder<'_, C> {
        self.request(Method::DELETE, url)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder<'_, C> {
        RequestBuilder {
            session: self,
            request: Request::new(method, url),
        }
    }

    /// Bypass the cache (no reads, no writes) while the guard lives.
    pub fn disabled(&self) -> DisabledGuard {
        self.disabled_depth.fetch_add(1, Ordering::SeqCst);
        DisabledGuard {
            depth: Arc::clone(&self.disabled_depth),
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled_depth.load(Ordering::SeqCst) > 0
    }

    /// Swap the session-wide default expiration at runtime.
    pub fn set_expire_after(&self, expire_after: impl Into<ExpireAfter>) {
        self.cache.set_expire_after(expire_after);
    }

    /// Drop expired responses and dangling redirect aliases.
    pub async fn delete_expired_responses(&self) -> Result<usize, Error> {
        self.cache.delete_expired_responses(None).await
    }

    /// Release backend connections if the backend opted into `autoclose`.
    pub async fn close(&self) -> Result<(), Error> {
        if self.cache.autoclose() {
            self.cache.close().await
        } else {
            Ok(())
        }
    }

    /// Run one request through the cache.
    ///
    /// Lookup, validity, conditional revalidation, fetch, and write-back all
    /// happen here; cache failures along the way degrade to misses or
    /// skipped writes and never fail the request itself.
    pub async fn send(&self, request: Request) -> Result<CachedResponse, Error> {
        if self.is_disabled() {
            let transport = self
                .client
                .execute(&request)
                .await
                .map_err(Error::Transport)?;
            let response = build_response(&request, transport, None);
            self.restore_cookies(&response);
            return Ok(response);
        }

        let config = self.cache.config();
        let key = self.cache.create_key(&request);
        let mut decision = CacheDecision::new(
            config.cache_control,
            config.expire_after,
            &config.urls_expire_after,
            &request.url,
            &request.headers,
            request.expire_after,
            request.refresh,
        );

        let mut stale: Option<CachedResponse> = None;
        if !decision.skip_read {
            if let Some(cached) = self.cache.get_response(&key).await {
                if !cached.is_expired() {
                    debug!(url = %request.url, "cache hit");
                    self.restore_cookies(&cached);
                    return Ok(cached);
                }
                debug!(url = %request.url, "cache entry expired");
                stale = Some(cached);
            }
        }

        let mut outbound = request.clone();
        if let Some(prev) = &stale {
            attach_validators(&mut outbound.headers, prev);
        }

        let transport = match self.client.execute(&outbound).await {
            Ok(transport) => transport,
            Err(err) => {
                if config.stale_if_error && let Some(prev) = stale {
                    warn!(url = %request.url, error = %err, "fetch failed; serving stale cached response");
                    self.restore_cookies(&prev);
                    return Ok(prev);
                }
                return Err(Error::Transport(err));
            }
        };

        let now = SystemTime::now();
        decision.update_from_response(config.cache_control, &transport.headers);

        if transport.status == StatusCode::NOT_MODIFIED
            && let Some(mut prev) = stale.take()
        {
            debug!(url = %request.url, "not modified; refreshing cached response");
            prev.expires = decision.expiration(now).instant();
            let storage_key = if prev.history.is_empty() {
                key.clone()
            } else {
                self.cache.response_key(&prev)
            };
            if !decision.skip_store(now)
                && let Err(err) = self.cache.save_response(&storage_key, &prev).await
            {
                warn!(url = %request.url, error = %err, "failed to refresh cached response");
            }
            self.restore_cookies(&prev);
            return Ok(prev);
        }

        let response = build_response(&request, transport, decision.expiration(now).instant());
        // A redirected exchange is stored under its final target's
        // fingerprint; each hop (the original request included) aliases it.
        let storage_key = if response.history.is_empty() {
            key.clone()
        } else {
            self.cache.response_key(&response)
        };
        if self.cache.check_cacheable(&response, &decision, &config).await {
            if let Err(err) = self.cache.save_response(&storage_key, &response).await {
                warn!(url = %request.url, error = %err, "failed to store response");
            }
        } else if stale.is_some()
            && let Err(err) = self.cache.delete(&key).await
        {
            warn!(url = %request.url, error = %err, "failed to drop expired cache entry");
        }
        self.restore_cookies(&response);
        Ok(response)
    }

    fn restore_cookies(&self, response: &CachedResponse) {
        if !response.cookies.is_empty() {
            self.client.store_cookies(&response.url, &response.cookies);
        }
        for entry in &response.history {
            if !entry.cookies.is_empty() {
                self.client.store_cookies(&entry.url, &entry.cookies);
            }
        }
    }
}

/// Sessions stack: a `CachedSession` is itself an `HttpClient`, so another
/// wrapper (retries, auth) can sit on top of the cache.
#[async_trait]
impl<C: HttpClient> HttpClient for CachedSession<C> {
    async fn execute(&self, request: &Request) -> Result<TransportResponse, BoxError> {
        let response = self.send(request.clone()).await.map_err(BoxError::from)?;
        Ok(TransportResponse {
            method: response.method.clone(),
            url: response.url.clone(),
            status: response.status,
            reason: response.reason.clone(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            history: response
                .history
                .iter()
                .map(|entry| TransportHop {
                    method: entry.method.clone(),
                    url: entry.url.clone(),
                    status: entry.status,
                    headers: entry.headers.clone(),
                    request_headers: entry.request.headers.clone(),
                    request_body: entry.request.body.clone(),
                })
                .collect(),
        })
    }

    fn store_cookies(&self, url: &Url, cookies: &[Cookie]) {
        self.client.store_cookies(url, cookies);
    }
}

/// Add `If-None-Match` / `If-Modified-Since` from a stored response's
/// validators, when it has any.
fn attach_validators(headers: &mut HeaderMap, prev: &CachedResponse) {
    if let Some(etag) = prev.headers.get(http::header::ETAG) {
        headers.insert(http::header::IF_NONE_MATCH, etag.clone());
    }
    if let Some(last_modified) = prev.headers.get(http::header::LAST_MODIFIED) {
        headers.insert(http::header::IF_MODIFIED_SINCE, last_modified.clone());
    }
}

fn build_response(
    request: &Request,
    transport: TransportResponse,
    expires: Option<SystemTime>,
) -> CachedResponse {
    let record = RequestRecord {
        method: request.method.clone(),
        url: request.url.clone(),
        headers: request.headers.clone(),
        body: request.body.to_bytes(),
    };
    let mut response = CachedResponse::new(
        transport.method,
        transport.url,
        transport.status,
        transport.reason,
        transport.headers,
        transport.body,
        record,
        expires,
    );
    response.history = transport
        .history
        .into_iter()
        .map(|hop| {
            let TransportHop {
                method,
                url,
                status,
                headers,
                request_headers,
                request_body,
            } = hop;
            let record = RequestRecord {
                method: method.clone(),
                url: url.clone(),
                headers: request_headers,
                body: request_body,
            };
            CachedResponse::new(
                method,
                url,
                status,
                None,
                headers,
                Bytes::new(),
                record,
                expires,
            )
        })
        .collect();
    response
}

/// Builds one request against a session.
pub struct RequestBuilder<'a, C> {
    session: &'a CachedSession<C>,
    request: Result<Request, Error>,
}

impl<'a, C: HttpClient> RequestBuilder<'a, C> {
    fn map(mut self, f: impl FnOnce(Request) -> Request) -> Self {
        self.request = self.request.map(f);
        self
    }

    pub fn header(self, name: HeaderName, value: HeaderValue) -> Self {
        self.map(|request| request.header(name, value))
    }

    pub fn headers(self, headers: HeaderMap) -> Self {
        self.map(|request| request.headers(headers))
    }

    pub fn query<K: AsRef<str>, V: AsRef<str>>(self, pairs: &[(K, V)]) -> Self {
        self.map(|request| request.query(pairs))
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.map(|request| request.json(value))
    }

    pub fn form(self, pairs: Vec<(String, String)>) -> Self {
        self.map(|request| request.form(pairs))
    }

    pub fn bytes(self, body: impl Into<Bytes>) -> Self {
        self.map(|request| request.bytes(body))
    }

    /// Per-request expiration, overriding URL patterns and the session
    /// default.
    pub fn expire_after(self, expire_after: impl Into<ExpireAfter>) -> Self {
        let expire_after = expire_after.into();
        self.map(|request| request.expire_after(expire_after))
    }

    /// Skip the cache read but still store the fresh response.
    pub fn refresh(self) -> Self {
        self.map(|request| request.refresh(true))
    }

    pub async fn send(self) -> Result<CachedResponse, Error> {
        self.session.send(self.request?).await
    }
}
