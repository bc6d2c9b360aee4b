use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::headers::Headers;

/// Boxed error used at collaborator seams (codecs, auth providers, transports).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// Error type for every fallible operation of the request pipeline.
///
/// Handlers recover locally only from the conditions they own (a retryable
/// status, a redirect, a claims challenge); every other variant reaches the
/// caller unchanged.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// A required collaborator is missing or invalid at construction time.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Single request attempt timed out
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Total operation deadline exceeded (including all retries)
    #[error("Operation deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Transport error (network, connection, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// JSON conversion between a parse node and a model failed
    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A registered codec failed to read or write a payload
    #[error("Codec for '{content_type}' failed: {source}")]
    Codec {
        content_type: String,
        #[source]
        source: BoxError,
    },

    /// No codec is registered for the content type, even after vendor-suffix fallback
    #[error("No codec registered for content type '{0}'")]
    UnsupportedContentType(String),

    /// URI template expansion failed
    #[error("Invalid URI template '{template}': {reason}")]
    UriTemplate { template: String, reason: String },

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// Invalid URL scheme for transport security configuration
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme {
        /// The URL scheme that was rejected
        scheme: String,
        /// Reason the scheme was rejected
        reason: String,
    },

    /// The redirect bound was exceeded for one logical call
    #[error("Too many redirects: exceeded the configured maximum of {max}")]
    TooManyRedirects { max: usize },

    /// A redirect changed the URL scheme and scheme changes are not allowed
    #[error(
        "Redirect from scheme '{from}' to '{to}' is not allowed; enable allow_scheme_change to follow it"
    )]
    DisallowedSchemeChange { from: String, to: String },

    /// Every permitted attempt ended in a retryable outcome
    #[error("Retries exhausted after {attempts} attempts; last outcome: {last}")]
    RetryExhausted {
        attempts: usize,
        last: Box<LastAttempt>,
    },

    /// The authentication provider failed; the source is its own error
    #[error("Authentication failed: {0}")]
    Authentication(#[source] BoxError),

    /// Non-success status without a matching error factory
    #[error(transparent)]
    Api(Box<ApiError>),

    /// Non-success status converted by a caller-supplied error factory
    #[error("HTTP {status}: {source}")]
    MappedStatus {
        status: StatusCode,
        #[source]
        source: BoxError,
    },

    /// The call was cancelled through its cancellation token
    #[error("Request cancelled")]
    Cancelled,
}

impl HttpError {
    /// Status code carried by API-level failures, if any.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Api(api) => Some(api.status),
            Self::MappedStatus { status, .. } => Some(*status),
            Self::RetryExhausted { last, .. } => match last.as_ref() {
                LastAttempt::Response { status, .. } => Some(*status),
                LastAttempt::Error(err) => err.status(),
            },
            _ => None,
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        HttpError::Api(Box::new(err))
    }
}

/// Generic failure for a non-success response.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
    /// Method of the request that produced the response, when known
    pub method: Option<Method>,
    /// URL of the request that produced the response, without query string
    pub url: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API request failed with status {}", self.status)?;
        if let (Some(method), Some(url)) = (&self.method, &self.url) {
            write!(f, " ({method} {url})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Last observed outcome of a retry loop.
#[derive(Debug)]
pub enum LastAttempt {
    /// A retryable response; the body is buffered up to the drain limit.
    Response {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// A retryable error.
    Error(Box<HttpError>),
}

impl fmt::Display for LastAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response { status, .. } => write!(f, "HTTP {status}"),
            Self::Error(err) => write!(f, "{err}"),
        }
    }
}
