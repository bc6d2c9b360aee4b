//! Ordered handler pipeline.
//!
//! A [`HandlerChain`] is built once and shared by every call. Each call walks
//! it with a [`Next`] cursor: a handler receives the cursor positioned just
//! after itself and either forwards through it (any number of times,
//! sequentially) or answers on its own. The cursor past the last handler sends
//! through the terminal [`Transport`].
//!
//! ```text
//! RetryHandler → RedirectHandler → ParametersNameDecodingHandler
//!     → UserAgentHandler → HeadersInspectionHandler → Transport
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::body::{NativeRequest, NativeResponse};
use crate::config::TransportConfig;
use crate::error::HttpError;
use crate::handlers::{
    HeadersInspectionHandler, ParametersNameDecodingHandler, RedirectHandler, RetryHandler,
    UserAgentHandler,
};
use crate::options::{HandlerOption, OptionsBag};
use crate::response::RequestOrigin;
use crate::transport::{HyperTransport, Transport};

/// One step of the pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used for the handler's tracing span
    fn name(&self) -> &'static str;

    /// Process `request`, forwarding through `next` to continue the chain.
    ///
    /// # Errors
    /// Returns the error of the inner chain unless the handler owns the
    /// condition, or an error of its own (e.g. `TooManyRedirects`).
    async fn handle(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError>;
}

/// Per-call state visible to every handler.
///
/// Scoped to a single logical call and never shared between calls.
#[derive(Debug, Clone)]
pub struct RequestContext {
    options: OptionsBag,
    cancellation: CancellationToken,
    span: Span,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(OptionsBag::new(), CancellationToken::new())
    }
}

impl RequestContext {
    /// Context with tracing disabled
    #[must_use]
    pub fn new(options: OptionsBag, cancellation: CancellationToken) -> Self {
        Self {
            options,
            cancellation,
            span: Span::none(),
        }
    }

    /// Parent span for handler spans; `Span::none()` disables them
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub fn options(&self) -> &OptionsBag {
        &self.options
    }

    /// Per-request override of a handler option
    #[must_use]
    pub fn option<T: HandlerOption>(&self) -> Option<&T> {
        self.options.get::<T>()
    }

    /// Per-request override, falling back to the handler's own options
    #[must_use]
    pub fn option_or<'a, T: HandlerOption>(&'a self, default: &'a T) -> &'a T {
        self.option::<T>().unwrap_or(default)
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Run `future` unless the call is cancelled first.
    ///
    /// # Errors
    /// Returns `HttpError::Cancelled` if the token fires before `future`
    /// completes, otherwise the future's own result.
    pub async fn run_cancellable<F, T>(&self, future: F) -> Result<T, HttpError>
    where
        F: Future<Output = Result<T, HttpError>>,
    {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(HttpError::Cancelled),
            result = future => result,
        }
    }

    /// Child span for a handler, disabled when the call is not traced
    #[must_use]
    pub fn handler_span(&self, handler: &'static str) -> Span {
        if self.span.is_disabled() {
            return Span::none();
        }
        tracing::debug_span!(parent: &self.span, "handler", handler)
    }
}

/// Cursor into the rest of a chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    handlers: &'a [Arc<dyn Handler>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    /// Send `request` through the remaining handlers and the transport.
    ///
    /// # Errors
    /// Returns `HttpError::Cancelled` when the call is cancelled before or
    /// during the send, otherwise whatever the inner chain returns.
    pub async fn run(
        self,
        request: NativeRequest,
        ctx: &RequestContext,
    ) -> Result<NativeResponse, HttpError> {
        if ctx.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        match self.handlers.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    handlers: rest,
                    transport: self.transport,
                };
                head.handle(request, ctx, next).await
            }
            None => {
                let origin = RequestOrigin::of(&request);
                let mut response = ctx.run_cancellable(self.transport.send(request)).await?;
                response.extensions_mut().insert(origin);
                Ok(response)
            }
        }
    }

    /// Number of handlers left before the transport
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.handlers.len()
    }
}

/// Handlers with the default options, outermost first.
#[must_use]
pub fn default_handlers() -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(RetryHandler::default()),
        Arc::new(RedirectHandler::default()),
        Arc::new(ParametersNameDecodingHandler::default()),
        Arc::new(UserAgentHandler::default()),
        Arc::new(HeadersInspectionHandler),
    ]
}

/// Immutable, shareable pipeline of handlers ending in a transport.
#[derive(Clone)]
pub struct HandlerChain {
    handlers: Arc<[Arc<dyn Handler>]>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handler_names())
            .finish_non_exhaustive()
    }
}

impl HandlerChain {
    /// Chain over `handlers`; the first one sees requests first and
    /// responses last.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self {
            handlers: handlers.into(),
            transport,
        }
    }

    /// Chain over `handlers`, using the default [`HyperTransport`] when no
    /// transport is given.
    ///
    /// # Errors
    /// Returns an error if the default transport cannot be created (TLS setup).
    pub fn build(
        handlers: Vec<Arc<dyn Handler>>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self, HttpError> {
        let transport = match transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(&TransportConfig::default())?),
        };
        Ok(Self::new(transport, handlers))
    }

    /// True when requests go straight to the transport
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[must_use]
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn head(&self) -> Next<'_> {
        Next {
            handlers: &self.handlers,
            transport: self.transport.as_ref(),
        }
    }

    /// Send `request` through the whole chain.
    ///
    /// # Errors
    /// See [`Next::run`].
    pub async fn send(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
    ) -> Result<NativeResponse, HttpError> {
        self.head().run(request, ctx).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::{RequestBody, full_body};
    use crate::testing::{MockTransport, get};
    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};
    use parking_lot::Mutex;

    /// Appends its tag to `x-trace` on the way in and records it on the way out
    struct Tagging {
        tag: &'static str,
        unwound: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for Tagging {
        fn name(&self) -> &'static str {
            self.tag
        }

        async fn handle(
            &self,
            mut request: NativeRequest,
            ctx: &RequestContext,
            next: Next<'_>,
        ) -> Result<NativeResponse, HttpError> {
            request
                .headers_mut()
                .append("x-trace", HeaderValue::from_static(self.tag));
            let response = next.run(request, ctx).await;
            self.unwound.lock().push(self.tag);
            response
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Handler for ShortCircuit {
        fn name(&self) -> &'static str {
            "short_circuit"
        }

        async fn handle(
            &self,
            _request: NativeRequest,
            _ctx: &RequestContext,
            _next: Next<'_>,
        ) -> Result<NativeResponse, HttpError> {
            let mut response = http::Response::new(full_body(Bytes::from_static(b"local")));
            *response.status_mut() = StatusCode::IM_A_TEAPOT;
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_first_handler_is_outermost() {
        let unwound = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport::ok();
        let chain = HandlerChain::new(
            transport.clone(),
            vec![
                Arc::new(Tagging {
                    tag: "a",
                    unwound: Arc::clone(&unwound),
                }),
                Arc::new(Tagging {
                    tag: "b",
                    unwound: Arc::clone(&unwound),
                }),
            ],
        );

        let response = chain
            .send(get("https://api.example.com/x"), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let seen = transport.requests();
        let tags: Vec<_> = seen[0].headers.get_all("x-trace").iter().collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(*unwound.lock(), vec!["b", "a"]);
        assert_eq!(chain.handler_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_chain_goes_to_transport() {
        let transport = MockTransport::ok();
        let chain = HandlerChain::new(transport.clone(), Vec::new());
        assert!(chain.is_empty());

        let response = chain
            .send(get("https://api.example.com/x"), &RequestContext::default())
            .await
            .unwrap();

        let origin = RequestOrigin::from_response(&response).unwrap();
        assert_eq!(origin.uri, "https://api.example.com/x");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_transport() {
        let transport = MockTransport::ok();
        let chain = HandlerChain::new(transport.clone(), vec![Arc::new(ShortCircuit)]);

        let response = chain
            .send(get("https://api.example.com/x"), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let transport = MockTransport::ok();
        let chain = HandlerChain::new(transport.clone(), Vec::new());
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::new(OptionsBag::new(), token);

        let err = chain
            .send(get("https://api.example.com/x"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_races_transport() {
        let transport = MockTransport::pending();
        let chain = HandlerChain::new(transport, Vec::new());
        let token = CancellationToken::new();
        let ctx = RequestContext::new(OptionsBag::new(), token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = chain
            .send(get("https://api.example.com/x"), &ctx)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, HttpError::Cancelled));
    }

    #[test]
    fn test_handler_span_disabled_without_parent() {
        let ctx = RequestContext::default();
        assert!(ctx.handler_span("retry").is_disabled());
    }

    #[test]
    fn test_default_handler_order() {
        let chain = HandlerChain::new(MockTransport::ok(), default_handlers());
        assert_eq!(
            chain.handler_names(),
            vec![
                "retry",
                "redirect",
                "parameters_name_decoding",
                "user_agent",
                "headers_inspection"
            ]
        );
    }

    #[tokio::test]
    async fn test_origin_records_replayability() {
        let transport = MockTransport::ok();
        let chain = HandlerChain::new(transport, Vec::new());
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri("https://api.example.com/upload")
            .body(RequestBody::stream(
                http_body_util::Full::new(Bytes::from_static(b"x")),
                None,
            ))
            .unwrap();

        let response = chain.send(request, &RequestContext::default()).await.unwrap();
        assert!(!RequestOrigin::from_response(&response).unwrap().replayable);
    }
}
