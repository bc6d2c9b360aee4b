//! In-crate transport doubles for handler and adapter tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::BodyExt;
use parking_lot::Mutex;

use crate::body::{NativeRequest, NativeResponse, RequestBody, full_body};
use crate::error::HttpError;
use crate::transport::Transport;

/// What the transport saw for one send.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Responder = Box<dyn Fn(usize, &Recorded) -> Result<http::Response<Bytes>, HttpError> + Send + Sync>;

/// Scripted transport; the responder gets the zero-based call index.
pub(crate) struct MockTransport {
    responder: Responder,
    pending: bool,
    seen: Mutex<Vec<Recorded>>,
}

impl MockTransport {
    pub fn new(
        responder: impl Fn(usize, &Recorded) -> Result<http::Response<Bytes>, HttpError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            pending: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Always 200 with an empty body
    pub fn ok() -> Arc<Self> {
        Self::new(|_, _| Ok(response(200)))
    }

    /// Never answers
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(|_, _| Ok(response(200))),
            pending: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Answers with the given statuses in order, repeating the last one
    pub fn statuses(statuses: &'static [u16]) -> Arc<Self> {
        Self::new(move |index, _| {
            let status = statuses[index.min(statuses.len() - 1)];
            Ok(response(status))
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: NativeRequest) -> Result<NativeResponse, HttpError> {
        let (parts, body) = request.into_parts();
        let body = body
            .into_box_body()
            .collect()
            .await
            .map_err(HttpError::Transport)?
            .to_bytes();
        let recorded = Recorded {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };
        let index = {
            let mut seen = self.seen.lock();
            seen.push(recorded.clone());
            seen.len() - 1
        };
        if self.pending {
            std::future::pending::<()>().await;
        }
        let reply = (self.responder)(index, &recorded)?;
        Ok(reply.map(full_body))
    }
}

pub(crate) fn response(status: u16) -> http::Response<Bytes> {
    let mut response = http::Response::new(Bytes::new());
    *response.status_mut() = StatusCode::from_u16(status).unwrap();
    response
}

pub(crate) fn response_with(
    status: u16,
    headers: &[(&'static str, &str)],
    body: &'static str,
) -> http::Response<Bytes> {
    let mut reply = response(status);
    for (name, value) in headers {
        reply
            .headers_mut()
            .append(*name, value.parse().unwrap());
    }
    *reply.body_mut() = Bytes::from_static(body.as_bytes());
    reply
}

pub(crate) fn get(url: &str) -> NativeRequest {
    http::Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(RequestBody::Empty)
        .unwrap()
}

pub(crate) fn with_body(method: Method, url: &str, body: impl Into<RequestBody>) -> NativeRequest {
    http::Request::builder()
        .method(method)
        .uri(url)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

/// POST whose body is a stream of unknown length
pub(crate) fn streaming_post(url: &str) -> NativeRequest {
    http::Request::builder()
        .method(Method::POST)
        .uri(url)
        .body(RequestBody::stream(
            http_body_util::Full::new(Bytes::from_static(b"stream")),
            None,
        ))
        .unwrap()
}
