//! Transparent, persistent response caching for asynchronous HTTP clients.
//!
//! A [`CachedSession`] wraps any client implementing [`session::HttpClient`]
//! and serves repeated requests from a pluggable [`storage::Storage`]
//! backend: in-memory, filesystem, SQLite, and (feature-gated) Redis,
//! MongoDB/GridFS, and DynamoDB. Requests are fingerprinted after
//! normalization, responses are snapshotted with their redirect history, and
//! expiration follows Cache-Control headers, per-URL patterns, or session
//! defaults. Cache failures never fail a request; they degrade to misses.

pub mod backend;
pub mod cache_control;
pub mod error;
pub mod expire;
pub mod key;
pub mod request;
pub mod response;
pub mod serialize;
pub mod session;
pub mod storage;

pub use backend::{CacheBackend, CacheConfig};
pub use error::{BoxError, Error};
pub use expire::ExpireAfter;
pub use request::{Body, Request};
pub use response::{CachedResponse, Cookie, Link, RequestRecord};
pub use session::{CachedSession, HttpClient, TransportHop, TransportResponse};
pub use storage::Storage;
