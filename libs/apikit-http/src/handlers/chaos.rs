use async_trait::async_trait;
use rand::Rng;
use tracing::Instrument;

use crate::body::{NativeRequest, NativeResponse, full_body};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::{ChaosFault, ChaosOptions};
use crate::error::HttpError;
use crate::response::RequestOrigin;

/// Answers a share of requests with a synthetic fault instead of sending
/// them. Meant for exercising retry paths in tests and staging.
#[derive(Debug, Clone, Default)]
pub struct ChaosHandler {
    options: ChaosOptions,
}

impl ChaosHandler {
    #[must_use]
    pub fn new(options: ChaosOptions) -> Self {
        Self { options }
    }
}

fn pick_fault(options: &ChaosOptions, request: &NativeRequest) -> Option<ChaosFault> {
    if let Some(selector) = &options.selector {
        return selector(request);
    }
    if options.chaos_percentage == 0 || options.known_faults.is_empty() {
        return None;
    }
    let mut rng = rand::rng();
    if rng.random_range(0..100u8) >= options.chaos_percentage {
        return None;
    }
    let index = rng.random_range(0..options.known_faults.len());
    options.known_faults.get(index).cloned()
}

fn synthetic_response(fault: ChaosFault, request: &NativeRequest) -> NativeResponse {
    let mut response = http::Response::new(full_body(fault.body));
    *response.status_mut() = fault.status;
    *response.headers_mut() = fault.headers;
    response.extensions_mut().insert(RequestOrigin::of(request));
    response
}

#[async_trait]
impl Handler for ChaosHandler {
    fn name(&self) -> &'static str {
        "chaos"
    }

    async fn handle(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let options = ctx.option_or(&self.options);
        let Some(fault) = pick_fault(options, &request) else {
            return next.run(request, ctx).await;
        };

        let span = ctx.handler_span(self.name());
        async move {
            tracing::debug!(
                status = %fault.status,
                method = %request.method(),
                "Injecting chaos fault"
            );
            Ok(synthetic_response(fault, &request))
        }
        .instrument(span)
        .await
    }
}
