//! Cache-Control interpretation and the per-request cache decision.

use std::time::{Duration, SystemTime};

use http::HeaderMap;
use url::Url;

use crate::expire::{ExpireAfter, ResolvedExpiration, UrlPattern, match_url_expiration};

/// Parsed Cache-Control directives, from one or more headers and
/// comma-separated lists.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(http::header::CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                if part.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if part.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if let Some(stripped) = part.strip_prefix("max-age=")
                    && let Ok(secs) = stripped.parse::<u64>()
                {
                    cc.max_age = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    cc
}

/// Parse an RFC 7231 / RFC 5322 HTTP date into a UTC instant.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value).ok()
}

/// What the cache should do for one request, settled before the request is
/// sent and refined once response headers are available.
///
/// Expiration precedence, highest first: request `max-age`, response
/// directives, the per-request override, the URL-pattern table, the session
/// default.
#[derive(Debug, Clone)]
pub struct CacheDecision {
    /// Do not consult the cache before fetching.
    pub skip_read: bool,
    /// Do not store the response, regardless of expiration.
    pub skip_write: bool,
    request_directive: Option<ExpireAfter>,
    response_directive: Option<ExpireAfter>,
    base: ExpireAfter,
}

impl CacheDecision {
    pub fn new(
        cache_control: bool,
        default_expire_after: ExpireAfter,
        urls_expire_after: &[(UrlPattern, ExpireAfter)],
        url: &Url,
        request_headers: &HeaderMap,
        request_expire_after: Option<ExpireAfter>,
        refresh: bool,
    ) -> Self {
        let mut skip_read = refresh;
        let mut skip_write = false;
        let mut request_directive = None;

        if cache_control {
            let cc = parse_cache_control(request_headers);
            if cc.no_store {
                skip_read = true;
                skip_write = true;
            }
            if cc.no_cache {
                skip_read = true;
            }
            request_directive = cc.max_age.map(ExpireAfter::from);
        }

        let base = request_expire_after
            .or_else(|| match_url_expiration(urls_expire_after, url))
            .unwrap_or(default_expire_after);

        Self {
            skip_read,
            skip_write,
            request_directive,
            response_directive: None,
            base,
        }
    }

    /// Fold response headers into the decision. `no-store` forbids the
    /// write; `max-age` and `Expires` set the expiration.
    pub fn update_from_response(&mut self, cache_control: bool, response_headers: &HeaderMap) {
        if !cache_control {
            return;
        }
        let cc = parse_cache_control(response_headers);
        if cc.no_store {
            self.skip_write = true;
            return;
        }
        if let Some(max_age) = cc.max_age {
            self.response_directive = Some(ExpireAfter::from(max_age));
            return;
        }
        if let Some(expires) = response_headers.get(http::header::EXPIRES)
            && let Ok(value) = expires.to_str()
            && let Some(instant) = parse_http_date(value)
        {
            self.response_directive = Some(ExpireAfter::At(instant));
        }
    }

    /// The effective expiration, anchored at `now`.
    pub fn expiration(&self, now: SystemTime) -> ResolvedExpiration {
        self.request_directive
            .or(self.response_directive)
            .unwrap_or(self.base)
            .resolve(now)
    }

    /// True when the response must not be stored, either by directive or
    /// because the effective expiration is immediate.
    pub fn skip_store(&self, now: SystemTime) -> bool {
        self.skip_write || self.expiration(now) == ResolvedExpiration::SkipStore
    }
}
