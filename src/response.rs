//! The persistable snapshot of an HTTP exchange.

use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

/// A cookie recorded from a `Set-Cookie` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// The request half of a cached exchange, kept so the snapshot can be
/// re-keyed and inspected after the original request is gone.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// One parsed element of a `Link` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub rel: Option<String>,
    pub params: Vec<(String, String)>,
}

/// A snapshot of one HTTP response, as stored in and served from the cache.
///
/// `history` holds the redirect chain that led here, oldest first; each entry
/// is itself a snapshot with the same lifecycle rules.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub method: Method,
    pub url: Url,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub encoding: Option<String>,
    pub cookies: Vec<Cookie>,
    pub request: RequestRecord,
    pub created_at: SystemTime,
    pub expires: Option<SystemTime>,
    pub history: Vec<CachedResponse>,
    from_cache: bool,
}

impl CachedResponse {
    pub fn new(
        method: Method,
        url: Url,
        status: StatusCode,
        reason: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        request: RequestRecord,
        expires: Option<SystemTime>,
    ) -> Self {
        let cookies = parse_set_cookies(&headers);
        let encoding = charset_from_headers(&headers);
        Self {
            method,
            url,
            status,
            reason,
            headers,
            body,
            encoding,
            cookies,
            request,
            created_at: SystemTime::now(),
            expires,
            history: Vec::new(),
            from_cache: false,
        }
    }

    /// True once the snapshot has been reconstituted from storage.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub(crate) fn mark_from_cache(&mut self) {
        self.from_cache = true;
        for entry in &mut self.history {
            entry.mark_from_cache();
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expires {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// The media type from `Content-Type`, without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.header_str(http::header::CONTENT_TYPE)
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_string())
    }

    /// The `charset` parameter of `Content-Type`, lowercased.
    pub fn charset(&self) -> Option<String> {
        charset_from_headers(&self.headers)
    }

    /// Decode the body as text. Cached bodies are stored as raw bytes, so
    /// decoding is lossy for non-UTF-8 content.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Parsed `Link` response headers.
    pub fn links(&self) -> Vec<Link> {
        self.headers
            .get_all(http::header::LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_link_header)
            .collect()
    }

    pub fn ok(&self) -> bool {
        self.status.as_u16() < 400
    }

    fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn charset_from_headers(headers: &HeaderMap) -> Option<String> {
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_lowercase())
        } else {
            None
        }
    })
}

fn parse_set_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(http::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| {
            let first = value.split(';').next()?;
            let (name, value) = first.split_once('=')?;
            Some(Cookie {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

fn parse_link_header(value: &str) -> Vec<Link> {
    let mut links = Vec::new();
    for element in split_link_elements(value) {
        let mut parts = element.split(';');
        let target = match parts.next().map(str::trim) {
            Some(target) if target.starts_with('<') && target.ends_with('>') => {
                target[1..target.len() - 1].to_string()
            }
            _ => continue,
        };
        let mut rel = None;
        let mut params = Vec::new();
        for param in parts {
            if let Some((name, value)) = param.split_once('=') {
                let name = name.trim().to_lowercase();
                let value = value.trim().trim_matches('"').to_string();
                if name == "rel" && rel.is_none() {
                    rel = Some(value);
                } else {
                    params.push((name, value));
                }
            }
        }
        links.push(Link { target, rel, params });
    }
    links
}

/// Split a Link header on the commas that separate elements, not the ones
/// inside `<...>` targets.
fn split_link_elements(value: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_target = false;
    for ch in value.chars() {
        match ch {
            '<' => in_target = true,
            '>' => in_target = false,
            ',' if !in_target => {
                if !current.trim().is_empty() {
                    elements.push(current.trim().to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        elements.push(current.trim().to_string());
    }
    elements
}
