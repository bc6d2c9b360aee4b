use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body_util::BodyExt;
use parking_lot::Mutex;

use crate::body::{NativeRequest, NativeResponse, ResponseBody};
use crate::error::HttpError;

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports two formats per RFC 7231:
/// - Seconds: "120" → 120 seconds
/// - HTTP-date (RFC 1123): "Wed, 21 Oct 2015 07:28:00 GMT" → duration until that time
///
/// Returns `None` if the header is missing, cannot be parsed, or lies in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    parse_http_date(trimmed)
}

/// Parse HTTP-date (RFC 1123) and return duration until that time.
fn parse_http_date(value: &str) -> Option<Duration> {
    let parsed = httpdate::parse_http_date(value).ok()?;
    parsed.duration_since(SystemTime::now()).ok()
}

/// Read a whole body, failing once it exceeds `limit` bytes.
///
/// The limit applies to decompressed bytes when the transport decompresses.
///
/// # Errors
/// Returns `HttpError::BodyTooLarge` past the limit, or `HttpError::Transport`
/// if reading a frame fails.
pub async fn read_body_limited(body: ResponseBody, limit: usize) -> Result<Bytes, HttpError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(HttpError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

/// Read at most `limit` bytes of a body and drop the rest.
///
/// For HTTP/1.1 the body must be consumed before the connection can be
/// reused; bodies larger than the limit cost a new connection instead.
///
/// # Errors
/// Returns `HttpError::Transport` if reading a frame fails.
pub async fn drain_body(body: ResponseBody, limit: usize) -> Result<Bytes, HttpError> {
    let mut kept = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            let room = limit.saturating_sub(kept.len());
            kept.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if kept.len() >= limit {
                break;
            }
        }
    }

    Ok(Bytes::from(kept))
}

/// Description of the exact request that produced a response.
///
/// Stored in the response extensions by the terminal hop of the chain and by
/// handlers that answer without forwarding.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Whether the request body could have been sent again
    pub replayable: bool,
}

impl RequestOrigin {
    #[must_use]
    pub fn of(request: &NativeRequest) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            replayable: request.body().is_replayable(),
        }
    }

    /// Origin attached to `response`, if any
    #[must_use]
    pub fn from_response(response: &NativeResponse) -> Option<&Self> {
        response.extensions().get::<Self>()
    }

    /// URI without query string, safe for logs and error messages
    #[must_use]
    pub fn sanitized_uri(&self) -> String {
        sanitize_uri(&self.uri)
    }
}

/// Render a URI without its query string
#[must_use]
pub fn sanitize_uri(uri: &Uri) -> String {
    format!(
        "{}://{}{}",
        uri.scheme_str().unwrap_or("https"),
        uri.authority().map_or("", |a| a.as_str()),
        uri.path()
    )
}

/// Single-slot sink receiving the raw response of a successful call.
///
/// When attached to a descriptor, the adapter stores the response here
/// instead of deserializing it. Clones share the slot.
#[derive(Clone, Default)]
pub struct NativeCapture {
    slot: Arc<Mutex<Option<NativeResponse>>>,
}

impl fmt::Debug for NativeCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCapture")
            .field("filled", &self.is_filled())
            .finish()
    }
}

impl NativeCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the captured response out of the slot
    #[must_use]
    pub fn take(&self) -> Option<NativeResponse> {
        self.slot.lock().take()
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub(crate) fn store(&self, response: NativeResponse) {
        *self.slot.lock() = Some(response);
    }
}
