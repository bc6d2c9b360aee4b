//! Native request and response types, and request body replay.
//!
//! A request can be sent more than once (retry, redirect, claims
//! re-authentication) only when its body can be reproduced. Empty and
//! buffered bodies always can. A stream with a declared length is buffered
//! on first use so it becomes replayable; a stream of unknown length is sent
//! once and every replaying handler fails open on it.

use std::fmt;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, HttpError};
use crate::response::read_body_limited;

/// Type-erased body used for streamed request content and for responses.
///
/// Response bodies may already be decompressed by the transport.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Request as it travels through the handler chain
pub type NativeRequest = http::Request<RequestBody>;

/// Response as it travels back through the handler chain
pub type NativeResponse = http::Response<ResponseBody>;

/// Request body content.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Fully buffered content, always replayable
    Buffered(Bytes),
    /// Streamed content; `length` is the declared size when known
    Streaming {
        body: ResponseBody,
        length: Option<u64>,
    },
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Streaming { length, .. } => f
                .debug_struct("Streaming")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

impl RequestBody {
    /// Wrap a streaming body
    pub fn stream<B>(body: B, length: Option<u64>) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self::Streaming {
            body: body.map_err(Into::into).boxed(),
            length,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Buffered(bytes) => bytes.is_empty(),
            Self::Streaming { length, .. } => *length == Some(0),
        }
    }

    /// Whether the body can be reproduced without reading it
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Empty | Self::Buffered(_))
    }

    /// Declared or actual length in bytes
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Buffered(bytes) => u64::try_from(bytes.len()).ok(),
            Self::Streaming { length, .. } => *length,
        }
    }

    /// Deep copy of a replayable body.
    ///
    /// The copy owns its own buffer; it never aliases the original's bytes.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Empty => Some(Self::Empty),
            Self::Buffered(bytes) => Some(Self::Buffered(Bytes::copy_from_slice(bytes))),
            Self::Streaming { .. } => None,
        }
    }

    /// Buffer a stream of known length so that it can be replayed.
    ///
    /// Streams of unknown length are returned untouched.
    ///
    /// # Errors
    /// Returns `HttpError::Cancelled` if the token fires while buffering,
    /// `HttpError::BodyTooLarge` if the stream yields more than it declared,
    /// or the stream's own error as `HttpError::Transport`.
    pub async fn into_replayable(self, cancellation: &CancellationToken) -> Result<Self, HttpError> {
        match self {
            Self::Streaming {
                body,
                length: Some(length),
            } => {
                let limit = usize::try_from(length).unwrap_or(usize::MAX);
                tokio::select! {
                    biased;
                    () = cancellation.cancelled() => Err(HttpError::Cancelled),
                    bytes = read_body_limited(body, limit) => Ok(Self::Buffered(bytes?)),
                }
            }
            other => Ok(other),
        }
    }

    /// Convert into the type-erased body handed to the transport
    #[must_use]
    pub fn into_box_body(self) -> ResponseBody {
        match self {
            Self::Empty => empty_body(),
            Self::Buffered(bytes) => full_body(bytes),
            Self::Streaming { body, .. } => body,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Buffered(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffered(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Buffered(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Buffered(Bytes::from_static(text.as_bytes()))
    }
}

/// Body holding `bytes`
#[must_use]
pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Body with no content
#[must_use]
pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Immutable copy of a replayable request.
///
/// Every [`to_request`](Self::to_request) produces an independent request
/// with its own body buffer, so a resend never shares bytes with an earlier
/// send.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    parts: http::request::Parts,
    body: Option<Bytes>,
}

impl ReplayRequest {
    /// Copy of `request`, or `None` when its body is a stream.
    ///
    /// Method, URI, version, headers and extensions are copied.
    #[must_use]
    pub fn of(request: &NativeRequest) -> Option<Self> {
        let body = match request.body() {
            RequestBody::Empty => None,
            RequestBody::Buffered(bytes) => Some(Bytes::copy_from_slice(bytes)),
            RequestBody::Streaming { .. } => return None,
        };
        let (mut parts, ()) = http::Request::new(()).into_parts();
        parts.method = request.method().clone();
        parts.uri = request.uri().clone();
        parts.version = request.version();
        parts.headers = request.headers().clone();
        parts.extensions = request.extensions().clone();
        Some(Self { parts, body })
    }

    #[must_use]
    pub fn method(&self) -> &http::Method {
        &self.parts.method
    }

    #[must_use]
    pub fn uri(&self) -> &http::Uri {
        &self.parts.uri
    }

    #[must_use]
    pub fn headers(&self) -> &http::HeaderMap {
        &self.parts.headers
    }

    /// Fresh request with a deep copy of the body
    #[must_use]
    pub fn to_request(&self) -> NativeRequest {
        let body = match &self.body {
            Some(bytes) => RequestBody::Buffered(Bytes::copy_from_slice(bytes)),
            None => RequestBody::Empty,
        };
        http::Request::from_parts(self.parts.clone(), body)
    }
}

/// Prepare a request for sending while keeping a replay copy.
///
/// Returns the request to send and, when the body is replayable, an
/// independent copy for later resends.
///
/// # Errors
/// Propagates errors from buffering a known-length stream.
pub async fn snapshot_for_replay(
    request: NativeRequest,
    cancellation: &CancellationToken,
) -> Result<(NativeRequest, Option<ReplayRequest>), HttpError> {
    let (parts, body) = request.into_parts();
    let body = body.into_replayable(cancellation).await?;
    let request = http::Request::from_parts(parts, body);
    let replay = ReplayRequest::of(&request);
    Ok((request, replay))
}
