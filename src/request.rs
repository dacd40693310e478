use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::error::Error;
use crate::expire::ExpireAfter;

/// Request payload in one of the forms the cache knows how to normalize.
///
/// JSON and form bodies participate in key derivation field-by-field so that
/// `ignored_params` can drop individual fields; raw bytes are hashed as-is.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    None,
    Bytes(Bytes),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

impl Body {
    pub fn is_none(&self) -> bool {
        matches!(self, Body::None)
    }

    /// The bytes that would go on the wire, for recording alongside a cached
    /// response. Normalization for key derivation happens separately.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Body::None => None,
            Body::Bytes(bytes) => Some(bytes.clone()),
            Body::Json(value) => serde_json::to_vec(value).ok().map(Bytes::from),
            Body::Form(pairs) => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                serializer.extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                Some(Bytes::from(serializer.finish().into_bytes()))
            }
        }
    }
}

/// An outbound request as seen by the cache layer, before it is handed to the
/// wrapped HTTP client.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
    /// Per-request expiration override.
    pub expire_after: Option<ExpireAfter>,
    /// Skip the cache read but still write the fresh response back.
    pub refresh: bool,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::None,
            expire_after: None,
            refresh: false,
        })
    }

    pub fn get(url: &str) -> Result<Self, Error> {
        Self::new(Method::GET, url)
    }

    pub fn head(url: &str) -> Result<Self, Error> {
        Self::new(Method::HEAD, url)
    }

    pub fn post(url: &str) -> Result<Self, Error> {
        Self::new(Method::POST, url)
    }

    /// Append query parameters to the request URL.
    pub fn query<K: AsRef<str>, V: AsRef<str>>(mut self, pairs: &[(K, V)]) -> Self {
        {
            let mut serializer = self.url.query_pairs_mut();
            for (name, value) in pairs {
                serializer.append_pair(name.as_ref(), value.as_ref());
            }
        }
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Body::Form(pairs);
        self
    }

    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    pub fn expire_after(mut self, expire_after: ExpireAfter) -> Self {
        self.expire_after = Some(expire_after);
        self
    }

    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}
