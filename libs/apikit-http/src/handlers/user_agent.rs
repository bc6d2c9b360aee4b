use async_trait::async_trait;
use http::{HeaderValue, header};
use tracing::Instrument;

use crate::body::{NativeRequest, NativeResponse};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::UserAgentOptions;
use crate::error::HttpError;

/// Appends `name/version` to the `User-Agent` header.
#[derive(Debug, Clone, Default)]
pub struct UserAgentHandler {
    options: UserAgentOptions,
}

impl UserAgentHandler {
    #[must_use]
    pub fn new(options: UserAgentOptions) -> Self {
        Self { options }
    }
}

/// The new header value, or `None` when the header should stay as is.
fn user_agent_value(existing: Option<&HeaderValue>, product: &str) -> Option<HeaderValue> {
    let combined = match existing {
        None => product.to_owned(),
        Some(value) => {
            // leave opaque values alone
            let current = value.to_str().ok()?;
            if current.split_whitespace().any(|token| token == product) {
                return None;
            }
            format!("{current} {product}")
        }
    };
    match HeaderValue::from_str(&combined) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(product = %product, error = %err, "Invalid User-Agent product token; header left unchanged");
            None
        }
    }
}

#[async_trait]
impl Handler for UserAgentHandler {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    async fn handle(
        &self,
        mut request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let options = ctx.option_or(&self.options);
        if !options.enabled {
            return next.run(request, ctx).await;
        }

        let span = ctx.handler_span(self.name());
        async move {
            let product = options.product();
            if let Some(value) = user_agent_value(request.headers().get(header::USER_AGENT), &product) {
                request.headers_mut().insert(header::USER_AGENT, value);
            }
            next.run(request, ctx).await
        }
        .instrument(span)
        .await
    }
}
