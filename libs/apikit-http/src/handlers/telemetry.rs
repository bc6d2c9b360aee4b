use async_trait::async_trait;
use tracing::Instrument;

use crate::body::{NativeRequest, NativeResponse};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::TelemetryOptions;
use crate::error::HttpError;

/// Runs a caller-supplied enricher on every outgoing request.
#[derive(Debug, Clone, Default)]
pub struct TelemetryHandler {
    options: TelemetryOptions,
}

impl TelemetryHandler {
    #[must_use]
    pub fn new(options: TelemetryOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Handler for TelemetryHandler {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn handle(
        &self,
        mut request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let options = ctx.option_or(&self.options);
        let Some(enricher) = &options.enricher else {
            return next.run(request, ctx).await;
        };

        let span = ctx.handler_span(self.name());
        async move {
            enricher(&mut request);
            next.run(request, ctx).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::chain::HandlerChain;
    use crate::options::OptionsBag;
    use crate::testing::{MockTransport, get};
    use http::HeaderValue;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_enricher_mutates_request() {
        let transport = MockTransport::ok();
        let handler = TelemetryHandler::new(TelemetryOptions::new(|request| {
            request
                .headers_mut()
                .insert("client-request-id", HeaderValue::from_static("abc-123"));
        }));
        let chain = HandlerChain::new(transport.clone(), vec![Arc::new(handler)]);

        chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(transport.requests()[0].headers["client-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn test_request_override_replaces_enricher() {
        let transport = MockTransport::ok();
        let handler = TelemetryHandler::new(TelemetryOptions::new(|request| {
            request
                .headers_mut()
                .insert("x-default", HeaderValue::from_static("1"));
        }));
        let chain = HandlerChain::new(transport.clone(), vec![Arc::new(handler)]);
        let ctx = RequestContext::new(
            OptionsBag::new().with(TelemetryOptions::new(|request| {
                request
                    .headers_mut()
                    .insert("x-override", HeaderValue::from_static("1"));
            })),
            CancellationToken::new(),
        );

        chain.send(get("https://h/x"), &ctx).await.unwrap();
        let seen = transport.requests();
        assert!(seen[0].headers.contains_key("x-override"));
        assert!(!seen[0].headers.contains_key("x-default"));
    }

    #[tokio::test]
    async fn test_without_enricher_passes_through() {
        let transport = MockTransport::ok();
        let chain = HandlerChain::new(transport.clone(), vec![Arc::new(TelemetryHandler::default())]);
        chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(transport.calls(), 1);
    }
}
