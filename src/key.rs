//! Request fingerprinting.
//!
//! Two requests that differ only in query-parameter order, header name case,
//! default ports, or any parameter listed in `ignored_params` hash to the
//! same key. The digest is a pure function of the request; no clock or
//! randomness is involved.

use http::{HeaderMap, Method};
use url::Url;

use crate::request::Body;

/// Knobs that shape the fingerprint, taken from the backend configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyOptions<'a> {
    /// Fold request headers into the digest.
    pub include_headers: bool,
    /// Query parameters, body fields, and (with `include_headers`) headers to
    /// leave out of the digest.
    pub ignored_params: &'a [String],
}

impl<'a> KeyOptions<'a> {
    fn is_ignored(&self, name: &str) -> bool {
        self.ignored_params.iter().any(|p| p == name)
    }

    fn is_ignored_header(&self, name: &str) -> bool {
        self.ignored_params.iter().any(|p| p.eq_ignore_ascii_case(name))
    }
}

/// Derive the cache key for a request.
pub fn create_key(
    method: &Method,
    url: &Url,
    body: &Body,
    headers: &HeaderMap,
    options: &KeyOptions<'_>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_str().to_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_url(url, options).as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(&normalize_body(body, options));
    if options.include_headers {
        hasher.update(b"\n");
        hasher.update(normalize_headers(headers, options).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Canonicalize a URL: the `url` crate already lowercases scheme and host and
/// drops default ports at parse time; on top of that, sort query parameters,
/// drop ignored and empty ones, and strip the fragment. All occurrences of a
/// repeated parameter are kept, so `?a=1&a=2` stays distinct from `?a=1`.
pub fn normalize_url(url: &Url, options: &KeyOptions<'_>) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut pairs: Vec<(String, String)> = normalized
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, v)| !(k.is_empty() && v.is_empty()))
        .filter(|(k, _)| !options.is_ignored(k))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        normalized.set_query(Some(&serializer.finish()));
    }
    normalized
}

fn normalize_body(body: &Body, options: &KeyOptions<'_>) -> Vec<u8> {
    match body {
        Body::None => Vec::new(),
        Body::Bytes(bytes) => bytes.to_vec(),
        Body::Json(value) => normalize_json(value, options),
        Body::Form(pairs) => {
            let mut filtered: Vec<&(String, String)> = pairs
                .iter()
                .filter(|(k, _)| !options.is_ignored(k))
                .collect();
            filtered.sort();
            filtered
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&")
                .into_bytes()
        }
    }
}

fn normalize_json(value: &serde_json::Value, options: &KeyOptions<'_>) -> Vec<u8> {
    match value {
        serde_json::Value::Object(map) => {
            // serde_json's default map is ordered by key, so re-collecting
            // after the filter yields a canonical serialization.
            let filtered: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter(|(k, _)| !options.is_ignored(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            serde_json::to_vec(&filtered).unwrap_or_default()
        }
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

fn normalize_headers(headers: &HeaderMap, options: &KeyOptions<'_>) -> String {
    let mut pairs: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !options.is_ignored_header(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_lowercase(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use http::header::{ACCEPT, AUTHORIZATION};

    use super::*;

    fn key(method: &str, url: &str) -> String {
        key_with(method, url, &KeyOptions::default())
    }

    fn key_with(method: &str, url: &str, options: &KeyOptions<'_>) -> String {
        create_key(
            &method.parse().unwrap(),
            &Url::parse(url).unwrap(),
            &Body::None,
            &HeaderMap::new(),
            options,
        )
    }

    #[test]
    fn query_order_does_not_matter() {
        assert_eq!(
            key("GET", "http://site.test/path?a=1&b=2"),
            key("GET", "http://site.test/path?b=2&a=1"),
        );
    }

    #[test]
    fn repeated_params_are_preserved() {
        assert_ne!(
            key("GET", "http://site.test/?a=1&a=2"),
            key("GET", "http://site.test/?a=1"),
        );
        assert_eq!(
            key("GET", "http://site.test/?a=2&a=1"),
            key("GET", "http://site.test/?a=1&a=2"),
        );
    }

    #[test]
    fn default_port_and_fragment_are_stripped() {
        assert_eq!(
            key("GET", "http://site.test:80/path#section"),
            key("GET", "http://site.test/path"),
        );
        assert_ne!(
            key("GET", "http://site.test:8080/path"),
            key("GET", "http://site.test/path"),
        );
    }

    #[test]
    fn ignored_params_do_not_change_the_key() {
        let ignored = vec!["token".to_string()];
        let options = KeyOptions {
            include_headers: false,
            ignored_params: &ignored,
        };
        assert_eq!(
            key_with("GET", "http://site.test/?token=A&q=1", &options),
            key_with("GET", "http://site.test/?q=1&token=B", &options),
        );
    }

    #[test]
    fn method_case_is_normalized_and_methods_are_distinct() {
        assert_ne!(key("GET", "http://site.test/"), key("HEAD", "http://site.test/"));
    }

    #[test]
    fn json_body_key_order_does_not_matter() {
        let a: serde_json::Value = serde_json::json!({"x": 1, "y": 2});
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        let url = Url::parse("http://site.test/").unwrap();
        let options = KeyOptions::default();
        let headers = HeaderMap::new();
        assert_eq!(
            create_key(&Method::POST, &url, &Body::Json(a), &headers, &options),
            create_key(&Method::POST, &url, &Body::Json(b), &headers, &options),
        );
    }

    #[test]
    fn ignored_json_field_is_dropped() {
        let ignored = vec!["token".to_string()];
        let options = KeyOptions {
            include_headers: false,
            ignored_params: &ignored,
        };
        let url = Url::parse("http://site.test/").unwrap();
        let headers = HeaderMap::new();
        let with = Body::Json(serde_json::json!({"q": 1, "token": "A"}));
        let without = Body::Json(serde_json::json!({"q": 1}));
        assert_eq!(
            create_key(&Method::POST, &url, &with, &headers, &options),
            create_key(&Method::POST, &url, &without, &headers, &options),
        );
    }

    #[test]
    fn headers_only_participate_when_included() {
        let url = "http://site.test/";
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, "application/json".parse().unwrap());

        let plain = KeyOptions::default();
        let with_headers = KeyOptions {
            include_headers: true,
            ignored_params: &[],
        };

        let parsed = Url::parse(url).unwrap();
        let base = create_key(&Method::GET, &parsed, &Body::None, &HeaderMap::new(), &plain);
        let same = create_key(&Method::GET, &parsed, &Body::None, &headers, &plain);
        assert_eq!(base, same);

        let keyed = create_key(&Method::GET, &parsed, &Body::None, &headers, &with_headers);
        let bare = create_key(
            &Method::GET,
            &parsed,
            &Body::None,
            &HeaderMap::new(),
            &with_headers,
        );
        assert_ne!(keyed, bare);
    }

    #[test]
    fn ignored_headers_are_dropped_case_insensitively() {
        let ignored = vec!["Authorization".to_string()];
        let options = KeyOptions {
            include_headers: true,
            ignored_params: &ignored,
        };
        let url = Url::parse("http://site.test/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(
            create_key(&Method::GET, &url, &Body::None, &headers, &options),
            create_key(&Method::GET, &url, &Body::None, &HeaderMap::new(), &options),
        );
    }
}
