use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

use super::{Transport, tls};
use crate::body::{NativeRequest, NativeResponse, ResponseBody};
use crate::config::{TransportConfig, TransportSecurity};
use crate::error::{HttpError, InvalidUriKind};

type WireService = BoxCloneSyncService<http::Request<ResponseBody>, NativeResponse, HttpError>;

/// Default transport: hyper-util pooled client over rustls.
///
/// Stack, outer to inner:
///
/// ```text
/// Timeout → Decompression → hyper client
/// ```
///
/// The timeout applies per attempt; every retry and redirect hop gets a
/// fresh one. Cloning is cheap and clones share the connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    service: WireService,
    security: TransportSecurity,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    /// # Errors
    /// Returns `HttpError::Tls` if the TLS root store cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self, HttpError> {
        if config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                target: "apikit_http::security",
                "Insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); use only against local mock servers"
            );
        }

        let https = tls::https_connector(config.tls_roots, config.transport)?;

        let mut builder = Client::builder(TokioExecutor::new());
        // the pool timer drives pool_idle_timeout
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle_timeout) = config.pool_idle_timeout {
            builder.pool_idle_timeout(idle_timeout);
        }
        let client = builder.build::<_, ResponseBody>(https);

        let timeout = config.request_timeout;
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(DecompressionLayer::new())
            .service(client)
            .map_response(box_response_body)
            .map_err(move |err: tower::BoxError| map_wire_error(err, timeout));

        Ok(Self {
            service: BoxCloneSyncService::new(service),
            security: config.transport,
        })
    }

    fn check_scheme(&self, uri: &Uri) -> Result<(), HttpError> {
        match uri.scheme_str() {
            Some("https") => Ok(()),
            Some("http") => match self.security {
                TransportSecurity::AllowInsecureHttp => Ok(()),
                TransportSecurity::TlsOnly => Err(HttpError::InvalidScheme {
                    scheme: "http".to_owned(),
                    reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
                }),
            },
            Some(scheme) => Err(HttpError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "only http:// and https:// schemes are supported".to_owned(),
            }),
            None => Err(HttpError::InvalidUri {
                url: uri.to_string(),
                kind: InvalidUriKind::MissingScheme,
                reason: "missing scheme".to_owned(),
            }),
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: NativeRequest) -> Result<NativeResponse, HttpError> {
        self.check_scheme(request.uri())?;
        let request: http::Request<ResponseBody> =
            request.map(crate::body::RequestBody::into_box_body);
        call_wire(self.service.clone(), request).await
    }
}

// Boxing the future outside the async fn keeps `Oneshot` out of the
// generator witness, sidestepping a higher-ranked `Send` inference bug.
fn call_wire(
    service: WireService,
    request: http::Request<ResponseBody>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<NativeResponse, HttpError>> + Send>>
{
    Box::pin(service.oneshot(request))
}

fn box_response_body<B>(response: http::Response<B>) -> NativeResponse
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<crate::error::BoxError>,
{
    response.map(|body| body.map_err(Into::into).boxed())
}

/// Whether a rustls error sits anywhere in the source chain.
///
/// `io::Error::source` skips the wrapped error, so io errors are unwrapped
/// explicitly.
fn is_tls_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<rustls::Error>() {
            return true;
        }
        if let Some(inner) = err
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::get_ref)
            && inner.is::<rustls::Error>()
        {
            return true;
        }
        current = err.source();
    }
    false
}

fn map_wire_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    if is_tls_failure(err.as_ref()) {
        return HttpError::Tls(err);
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::RequestBody;
    use crate::response::read_body_limited;
    use httpmock::prelude::*;
    use std::io::Write;

    fn transport() -> HyperTransport {
        HyperTransport::new(&TransportConfig::for_testing()).unwrap()
    }

    fn request(method: http::Method, url: &str, body: RequestBody) -> NativeRequest {
        http::Request::builder()
            .method(method)
            .uri(url)
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_rejected_with_tls_only() {
        let transport = HyperTransport::new(&TransportConfig::default()).unwrap();
        let err = transport
            .send(request(http::Method::GET, "http://example.com/test", RequestBody::Empty))
            .await
            .unwrap_err();

        match err {
            HttpError::InvalidScheme { scheme, reason } => {
                assert_eq!(scheme, "http");
                assert!(reason.contains("TlsOnly"));
            }
            other => panic!("expected InvalidScheme, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let err = transport()
            .send(request(http::Method::GET, "ftp://example.com/file", RequestBody::Empty))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidScheme { scheme, .. } if scheme == "ftp"));
    }

    #[tokio::test]
    async fn test_sends_body_and_returns_any_status() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/items").body(r#"{"a":1}"#);
            then.status(500).body("boom");
        });

        let response = transport()
            .send(request(
                http::Method::POST,
                &server.url("/items"),
                RequestBody::from(r#"{"a":1}"#),
            ))
            .await
            .unwrap();

        mock.assert();
        assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = read_body_limited(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"boom");
    }

    #[tokio::test]
    async fn test_gzip_response_is_decompressed() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"compressed":true}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gz");
            then.status(200)
                .header("content-encoding", "gzip")
                .header("content-type", "application/json")
                .body(compressed);
        });

        let response = transport()
            .send(request(http::Method::GET, &server.url("/gz"), RequestBody::Empty))
            .await
            .unwrap();
        let body = read_body_limited(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"compressed":true}"#);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_millis(500));
        });

        let transport =
            HyperTransport::new(&TransportConfig::for_testing().with_timeout(Duration::from_millis(50)))
                .unwrap();
        let err = transport
            .send(request(http::Method::GET, &server.url("/slow"), RequestBody::Empty))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[test]
    fn test_insecure_http_warning_emitted() {
        use parking_lot::Mutex;
        use std::sync::Arc;
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = MessageVisitor(String::new());
                    event.record(&mut visitor);
                    self.warnings.lock().push(visitor.0);
                }
            }
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let capture = WarningCapture::default();
        let warnings = capture.warnings.clone();
        let subscriber = tracing_subscriber::registry().with(capture);

        tracing::subscriber::with_default(subscriber, || {
            _ = HyperTransport::new(&TransportConfig::default());
            assert!(warnings.lock().is_empty());
            _ = HyperTransport::new(&TransportConfig::for_testing());
        });

        let captured = warnings.lock();
        assert_eq!(captured.len(), 1, "{:?}", *captured);
        assert!(captured[0].contains("Insecure HTTP"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let err = transport()
            .send(request(http::Method::GET, "http://127.0.0.1:1/none", RequestBody::Empty))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Transport(_)));
    }
}
