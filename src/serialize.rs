//! Converting response snapshots to and from stored bytes.
//!
//! The plain envelope is a serde_json document; unknown fields are ignored
//! and optional fields default on read, so older entries written by previous
//! layouts still deserialize. The signed envelope prepends a 32-byte keyed
//! blake3 tag over the plain bytes; a tag mismatch fails the read without
//! exposing the payload.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;
use crate::response::{CachedResponse, Cookie, RequestRecord};

const SIGNING_CONTEXT: &str = "recache v1 signed response envelope";
const TAG_LEN: usize = blake3::OUT_LEN;

#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    method: String,
    url: String,
    status: u16,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    cookies: Vec<(String, String)>,
    request: StoredRequest,
    created_at: u64,
    #[serde(default)]
    expires: Option<u64>,
    #[serde(default)]
    history: Vec<StoredResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: Option<String>,
}

/// Serializes snapshots, optionally under a signing key.
#[derive(Debug, Clone)]
pub struct Serializer {
    key: Option<[u8; 32]>,
}

impl Serializer {
    pub fn plain() -> Self {
        Self { key: None }
    }

    /// Signed mode. The secret may be any length; it is stretched to a
    /// 32-byte key before use.
    pub fn signed(secret: &[u8]) -> Self {
        Self {
            key: Some(blake3::derive_key(SIGNING_CONTEXT, secret)),
        }
    }

    pub fn serialize(&self, response: &CachedResponse) -> Result<Vec<u8>, Error> {
        let stored = to_stored(response);
        let payload =
            serde_json::to_vec(&stored).map_err(|err| Error::Serialization(err.to_string()))?;
        match &self.key {
            None => Ok(payload),
            Some(key) => {
                let tag = blake3::keyed_hash(key, &payload);
                let mut out = Vec::with_capacity(TAG_LEN + payload.len());
                out.extend_from_slice(tag.as_bytes());
                out.extend_from_slice(&payload);
                Ok(out)
            }
        }
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<CachedResponse, Error> {
        let payload = match &self.key {
            None => bytes,
            Some(key) => {
                if bytes.len() < TAG_LEN {
                    return Err(Error::Integrity);
                }
                let (tag, payload) = bytes.split_at(TAG_LEN);
                let mut expected = [0u8; TAG_LEN];
                expected.copy_from_slice(tag);
                // blake3::Hash comparison is constant-time.
                if blake3::keyed_hash(key, payload) != blake3::Hash::from_bytes(expected) {
                    return Err(Error::Integrity);
                }
                payload
            }
        };
        let stored: StoredResponse =
            serde_json::from_slice(payload).map_err(|err| Error::Serialization(err.to_string()))?;
        let mut response = from_stored(stored)?;
        response.mark_from_cache();
        Ok(response)
    }
}

fn to_stored(response: &CachedResponse) -> StoredResponse {
    StoredResponse {
        method: response.method.to_string(),
        url: response.url.to_string(),
        status: response.status.as_u16(),
        reason: response.reason.clone(),
        headers: headermap_to_vec(&response.headers),
        body: BASE64.encode(&response.body),
        encoding: response.encoding.clone(),
        cookies: response
            .cookies
            .iter()
            .map(|cookie| (cookie.name.clone(), cookie.value.clone()))
            .collect(),
        request: StoredRequest {
            method: response.request.method.to_string(),
            url: response.request.url.to_string(),
            headers: headermap_to_vec(&response.request.headers),
            body: response.request.body.as_ref().map(|body| BASE64.encode(body)),
        },
        created_at: unix_seconds(response.created_at),
        expires: response.expires.map(unix_seconds),
        history: response.history.iter().map(to_stored).collect(),
    }
}

fn from_stored(stored: StoredResponse) -> Result<CachedResponse, Error> {
    let method = parse_method(&stored.method)?;
    let url = parse_url(&stored.url)?;
    let status = StatusCode::from_u16(stored.status)
        .map_err(|err| Error::Serialization(err.to_string()))?;
    let body = decode_base64(&stored.body)?;
    let request = RequestRecord {
        method: parse_method(&stored.request.method)?,
        url: parse_url(&stored.request.url)?,
        headers: to_headermap(&stored.request.headers),
        body: match &stored.request.body {
            Some(encoded) => Some(decode_base64(encoded)?),
            None => None,
        },
    };

    let mut response = CachedResponse::new(
        method,
        url,
        status,
        stored.reason,
        to_headermap(&stored.headers),
        body,
        request,
        stored.expires.map(from_unix_seconds),
    );
    response.created_at = from_unix_seconds(stored.created_at);
    response.encoding = stored.encoding;
    response.cookies = stored
        .cookies
        .into_iter()
        .map(|(name, value)| Cookie { name, value })
        .collect();
    response.history = stored
        .history
        .into_iter()
        .map(from_stored)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(response)
}

fn parse_method(value: &str) -> Result<Method, Error> {
    value
        .parse::<Method>()
        .map_err(|err| Error::Serialization(err.to_string()))
}

fn parse_url(value: &str) -> Result<Url, Error> {
    Url::parse(value).map_err(|err| Error::Serialization(err.to_string()))
}

fn decode_base64(value: &str) -> Result<Bytes, Error> {
    BASE64
        .decode(value)
        .map(Bytes::from)
        .map_err(|err| Error::Serialization(err.to_string()))
}

fn unix_seconds(instant: SystemTime) -> u64 {
    instant
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn from_unix_seconds(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
