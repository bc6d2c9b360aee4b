use async_trait::async_trait;
use tracing::Instrument;

use crate::body::{NativeRequest, NativeResponse};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::HeadersInspectionOptions;
use crate::error::HttpError;

/// Copies outgoing and incoming headers into the sinks of the
/// [`HeadersInspectionOptions`] attached to the request.
///
/// The handler keeps no sinks of its own, so a request without the option
/// is forwarded untouched and concurrent calls never see each other's
/// headers. Keep a clone of the option to read the captured headers after
/// the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersInspectionHandler;

#[async_trait]
impl Handler for HeadersInspectionHandler {
    fn name(&self) -> &'static str {
        "headers_inspection"
    }

    async fn handle(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let Some(options) = ctx.option::<HeadersInspectionOptions>() else {
            return next.run(request, ctx).await;
        };
        if !options.inspect_request_headers && !options.inspect_response_headers {
            return next.run(request, ctx).await;
        }

        let span = ctx.handler_span(self.name());
        async move {
            if options.inspect_request_headers {
                options.record_request(request.headers());
            }
            let response = next.run(request, ctx).await?;
            if options.inspect_response_headers {
                options.record_response(response.headers());
            }
            Ok(response)
        }
        .instrument(span)
        .await
    }
}
