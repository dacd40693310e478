//! Shared test fixtures: a scripted in-process HTTP client and snapshot
//! builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use recache::response::RequestRecord;
use recache::session::{HttpClient, TransportHop, TransportResponse};
use recache::{BoxError, CachedResponse, Cookie, Request};

/// A scripted response template, served when its URL is requested.
#[derive(Clone)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    /// Redirect hops that "led" to this response, as `(url, status)` pairs,
    /// oldest first. When set, the final URL may differ from the request.
    hops: Vec<(String, u16)>,
    final_url: Option<String>,
    fail: bool,
}

pub fn ok(body: &str) -> MockResponse {
    with_status(200, body)
}

pub fn with_status(status: u16, body: &str) -> MockResponse {
    MockResponse {
        status,
        headers: Vec::new(),
        body: body.to_string(),
        hops: Vec::new(),
        final_url: None,
        fail: false,
    }
}

pub fn failing() -> MockResponse {
    MockResponse {
        status: 0,
        headers: Vec::new(),
        body: String::new(),
        hops: Vec::new(),
        final_url: None,
        fail: true,
    }
}

impl MockResponse {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Mark this response as the end of a redirect chain that started at
    /// `from` and landed on `final_url`.
    pub fn redirected(mut self, from: &str, status: u16, final_url: &str) -> Self {
        self.hops.push((from.to_string(), status));
        self.final_url = Some(final_url.to_string());
        self
    }
}

/// In-process stand-in for an HTTP client, with per-URL response scripts and
/// request counting.
#[derive(Default)]
pub struct MockClient {
    routes: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    requests: AtomicUsize,
    seen_headers: Mutex<Vec<HeaderMap>>,
    cookies: Mutex<Vec<(Url, Vec<Cookie>)>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `url`. The last queued response for a URL is
    /// sticky: it keeps being served once the queue ahead of it drains.
    pub fn route(&self, url: &str, response: MockResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn request_headers(&self, index: usize) -> Option<HeaderMap> {
        self.seen_headers.lock().unwrap().get(index).cloned()
    }

    pub fn stored_cookies(&self) -> Vec<(Url, Vec<Cookie>)> {
        self.cookies.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockClient {
    async fn execute(&self, request: &Request) -> Result<TransportResponse, BoxError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.seen_headers.lock().unwrap().push(request.headers.clone());

        let template = {
            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .get_mut(request.url.as_str())
                .ok_or_else(|| format!("no route for {}", request.url))?;
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue
                    .front()
                    .cloned()
                    .ok_or_else(|| format!("route for {} is exhausted", request.url))?
            }
        };

        if template.fail {
            return Err("connection refused".into());
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &template.headers {
            headers.append(
                name.parse::<HeaderName>().map_err(BoxError::from)?,
                HeaderValue::from_str(value).map_err(BoxError::from)?,
            );
        }
        let url = match &template.final_url {
            Some(final_url) => Url::parse(final_url).map_err(BoxError::from)?,
            None => request.url.clone(),
        };
        let history = template
            .hops
            .iter()
            .map(|(hop_url, status)| {
                Ok(TransportHop {
                    method: request.method.clone(),
                    url: Url::parse(hop_url)?,
                    status: StatusCode::from_u16(*status).expect("valid status"),
                    headers: HeaderMap::new(),
                    // Redirects re-send the request headers (and body, when
                    // the client preserves it) on every hop.
                    request_headers: request.headers.clone(),
                    request_body: request.body.to_bytes(),
                })
            })
            .collect::<Result<Vec<_>, url::ParseError>>()
            .map_err(BoxError::from)?;

        Ok(TransportResponse {
            method: request.method.clone(),
            url,
            status: StatusCode::from_u16(template.status).expect("valid status"),
            reason: None,
            headers,
            body: Bytes::from(template.body.clone()),
            history,
        })
    }

    fn store_cookies(&self, url: &Url, cookies: &[Cookie]) {
        self.cookies
            .lock()
            .unwrap()
            .push((url.clone(), cookies.to_vec()));
    }
}

/// A minimal GET snapshot for exercising the facade directly.
pub fn snapshot(url: &str, status: u16, body: &str) -> CachedResponse {
    let url = Url::parse(url).expect("valid url");
    CachedResponse::new(
        Method::GET,
        url.clone(),
        StatusCode::from_u16(status).expect("valid status"),
        None,
        HeaderMap::new(),
        Bytes::from(body.to_string()),
        RequestRecord {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        },
        None,
    )
}
