use thiserror::Error;

/// Boxed error type used at the transport and backend seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the cache layer.
///
/// Only configuration errors (`InvalidPattern`, `InvalidUrl`) are raised
/// eagerly at construction time. Everything the cache encounters while
/// serving a request degrades to a miss or a skipped write; transport
/// failures from the wrapped HTTP client propagate unchanged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(#[source] BoxError),

    #[error("signature mismatch on cached entry")]
    Integrity,

    #[error("failed to decode cached entry: {0}")]
    Serialization(String),

    #[error("item of {size} bytes exceeds the backend limit of {limit} bytes")]
    OversizedItem { size: usize, limit: usize },

    #[error("invalid URL pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that must surface as a cache miss on the read path
    /// rather than failing the request.
    pub fn is_miss_on_read(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_)
                | Error::Integrity
                | Error::Serialization(_)
                | Error::Io(_)
        )
    }

    pub(crate) fn backend(err: impl Into<BoxError>) -> Self {
        Error::BackendUnavailable(err.into())
    }
}
