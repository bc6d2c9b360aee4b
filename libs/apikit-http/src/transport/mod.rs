//! Terminal senders.
//!
//! [`HyperTransport`] is the default. Any tower service over the native
//! request and response types can be plugged in through [`ServiceTransport`].

mod client;
mod tls;

use async_trait::async_trait;
use tower::{Service, ServiceExt};

use crate::body::{NativeRequest, NativeResponse};
use crate::error::HttpError;

pub use self::client::HyperTransport;

/// Sends a native request and returns the native response.
///
/// Every status is an `Ok` response; only failures to obtain a response at
/// all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    /// Returns transport-level failures (`Transport`, `Tls`, `Timeout`,
    /// `InvalidScheme`).
    async fn send(&self, request: NativeRequest) -> Result<NativeResponse, HttpError>;
}

/// Adapts a cloneable tower service into a [`Transport`].
///
/// Each send drives a fresh clone of the service, so the service does not
/// need to be `Sync`-safe across concurrent readiness checks.
#[derive(Debug, Clone)]
pub struct ServiceTransport<S> {
    service: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> Transport for ServiceTransport<S>
where
    S: Service<NativeRequest, Response = NativeResponse, Error = HttpError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    async fn send(&self, request: NativeRequest) -> Result<NativeResponse, HttpError> {
        self.service.clone().oneshot(request).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::full_body;
    use crate::testing::get;
    use bytes::Bytes;
    use http::StatusCode;

    #[tokio::test]
    async fn test_service_fn_as_transport() {
        let service = tower::service_fn(|request: NativeRequest| async move {
            let mut response = http::Response::new(full_body(Bytes::from(request.uri().path().to_owned())));
            *response.status_mut() = StatusCode::ACCEPTED;
            Ok::<_, HttpError>(response)
        });
        let transport = ServiceTransport::new(service);

        let response = transport.send(get("https://h/echo")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_service_errors_pass_through() {
        let service = tower::service_fn(|_request: NativeRequest| async move {
            Err::<NativeResponse, _>(HttpError::Timeout(std::time::Duration::from_secs(1)))
        });
        let err = ServiceTransport::new(service)
            .send(get("https://h/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Timeout(_)));
    }
}
