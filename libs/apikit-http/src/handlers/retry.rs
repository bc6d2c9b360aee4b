use std::time::Duration;

use async_trait::async_trait;
use http::HeaderValue;
use rand::Rng;
use tokio::time::Instant;
use tracing::Instrument;

use crate::body::{NativeRequest, NativeResponse, ReplayRequest, snapshot_for_replay};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::{ExponentialBackoff, RetryDecision, RetryOptions, RetryTrigger};
use crate::error::{HttpError, LastAttempt};
use crate::response::{drain_body, parse_retry_after, sanitize_uri};

/// Header carrying the retry number (1-based) on resent requests
pub const RETRY_ATTEMPT_HEADER: &str = "Retry-Attempt";

/// Resends requests that end in a transient failure.
///
/// Attempts are strictly sequential. The delay honors `Retry-After` unless
/// disabled, and otherwise follows the exponential backoff. A request whose
/// body cannot be replayed is sent once and its outcome returned unchanged.
///
/// When every permitted attempt fails, the call fails with
/// `HttpError::RetryExhausted` carrying the last response (status, headers
/// and up to `drain_limit` bytes of body) or the last error.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    options: RetryOptions,
}

impl RetryHandler {
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

/// Retry trigger of a failed send
fn error_trigger(err: &HttpError) -> RetryTrigger {
    match err {
        HttpError::Transport(_) => RetryTrigger::TransportError,
        HttpError::Timeout(_) => RetryTrigger::Timeout,
        _ => RetryTrigger::NonRetryable,
    }
}

/// Clamp `delay` to the remaining budget, failing once none is left.
fn within_deadline(
    delay: Duration,
    deadline: Option<(Instant, Duration)>,
) -> Result<Duration, HttpError> {
    let Some((deadline, total)) = deadline else {
        return Ok(delay);
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(HttpError::DeadlineExceeded(total));
    }
    Ok(delay.min(remaining))
}

async fn sleep_cancellable(ctx: &RequestContext, delay: Duration) -> Result<(), HttpError> {
    ctx.run_cancellable(async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

async fn run_with_retries(
    options: &RetryOptions,
    request: NativeRequest,
    template: &ReplayRequest,
    ctx: &RequestContext,
    next: Next<'_>,
) -> Result<NativeResponse, HttpError> {
    let method = template.method().clone();
    let url = sanitize_uri(template.uri());
    let has_idempotency_key = options
        .idempotency_key_header
        .as_ref()
        .is_some_and(|name| template.headers().contains_key(name));
    let deadline = options
        .total_timeout
        .map(|total| (Instant::now() + total, total));

    let mut first = Some(request);
    let mut attempt = 0usize;
    loop {
        if let Some((deadline, total)) = deadline
            && Instant::now() >= deadline
        {
            return Err(HttpError::DeadlineExceeded(total));
        }

        let request = match first.take() {
            Some(request) => request,
            None => {
                let mut request = template.to_request();
                request
                    .headers_mut()
                    .insert(RETRY_ATTEMPT_HEADER, HeaderValue::from(attempt));
                request
            }
        };

        let outcome = next.run(request, ctx).await;
        let trigger = match &outcome {
            Ok(response) => RetryTrigger::Status(response.status().as_u16()),
            Err(err) => error_trigger(err),
        };
        let decision = RetryDecision {
            attempt,
            method: method.clone(),
            trigger,
            has_idempotency_key,
        };
        if !options.should_retry(&decision) {
            return outcome;
        }

        let exhausted = attempt >= options.max_retries;
        let (delay, last) = match outcome {
            Ok(response) => {
                let retry_after = if options.ignore_retry_after {
                    None
                } else {
                    parse_retry_after(response.headers())
                };
                let (parts, body) = response.into_parts();
                let kept = match drain_body(body, options.drain_limit).await {
                    Ok(kept) => kept,
                    Err(err) => {
                        tracing::debug!(error = %err, "Failed to drain response body before retry");
                        bytes::Bytes::new()
                    }
                };
                let delay =
                    retry_after.unwrap_or_else(|| calculate_backoff(&options.backoff, attempt));
                let last = LastAttempt::Response {
                    status: parts.status,
                    headers: parts.headers,
                    body: kept,
                };
                (delay, last)
            }
            Err(err) => (
                calculate_backoff(&options.backoff, attempt),
                LastAttempt::Error(Box::new(err)),
            ),
        };

        if exhausted {
            tracing::debug!(
                attempts = attempt + 1,
                method = %method,
                url = %url,
                last = %last,
                "Retries exhausted"
            );
            return Err(HttpError::RetryExhausted {
                attempts: attempt + 1,
                last: Box::new(last),
            });
        }

        let delay = within_deadline(delay, deadline)?;
        tracing::debug!(
            retry = attempt + 1,
            max_retries = options.max_retries,
            trigger = ?trigger,
            method = %method,
            url = %url,
            backoff_ms = delay.as_millis(),
            last = %last,
            "Retrying request"
        );
        sleep_cancellable(ctx, delay).await?;
        attempt += 1;
    }
}

#[async_trait]
impl Handler for RetryHandler {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let options = ctx.option_or(&self.options);
        if options.max_retries == 0 {
            return next.run(request, ctx).await;
        }

        let span = ctx.handler_span(self.name());
        async move {
            let (request, template) = snapshot_for_replay(request, ctx.cancellation()).await?;
            match template {
                Some(template) => run_with_retries(options, request, &template, ctx, next).await,
                None => {
                    tracing::debug!("Request body is not replayable; sending without retries");
                    next.run(request, ctx).await
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Backoff for the given zero-based attempt.
///
/// Non-finite or negative settings are sanitized instead of panicking, and
/// the result never exceeds one day.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };
    let initial = backoff.initial.as_secs_f64();
    let max = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base = initial * multiplier.powi(exponent);
    let clamped = if base.is_finite() {
        base.clamp(0.0, max)
    } else {
        max
    };
    let delay = Duration::from_secs_f64(clamped);

    let delay = if backoff.jitter {
        let factor = rand::rng().random_range(0.0..=0.25);
        delay + delay.mul_f64(factor)
    } else {
        delay
    };
    delay.min(Duration::from_secs_f64(max))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::chain::HandlerChain;
    use crate::options::OptionsBag;
    use crate::testing::{MockTransport, get, response, response_with, streaming_post, with_body};
    use http::{Method, StatusCode};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn chain(transport: Arc<MockTransport>, options: RetryOptions) -> HandlerChain {
        HandlerChain::new(transport, vec![Arc::new(RetryHandler::new(options))])
    }

    #[tokio::test]
    async fn test_success_is_not_retried() {
        let transport = MockTransport::ok();
        let chain = chain(transport.clone(), RetryOptions::fast());

        let response = chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_get_retried_until_success_with_attempt_header() {
        let transport = MockTransport::statuses(&[503, 502, 200]);
        let chain = chain(transport.clone(), RetryOptions::fast());

        let response = chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let seen = transport.requests();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].headers.get(RETRY_ATTEMPT_HEADER).is_none());
        assert_eq!(seen[1].headers[RETRY_ATTEMPT_HEADER], "1");
        assert_eq!(seen[2].headers[RETRY_ATTEMPT_HEADER], "2");
    }

    #[tokio::test]
    async fn test_post_not_retried_on_5xx() {
        let transport = MockTransport::statuses(&[500]);
        let chain = chain(transport.clone(), RetryOptions::fast());

        let response = chain
            .send(with_body(Method::POST, "https://h/x", "{}"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_post_with_idempotency_key_is_retried() {
        let transport = MockTransport::statuses(&[500, 200]);
        let chain = chain(transport.clone(), RetryOptions::fast());
        let mut request = with_body(Method::POST, "https://h/x", r#"{"n":1}"#);
        request
            .headers_mut()
            .insert("idempotency-key", HeaderValue::from_static("k-1"));

        let response = chain.send(request, &RequestContext::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let seen = transport.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(&seen[1].body[..], br#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_post_not_retried_on_429_without_key() {
        let transport = MockTransport::statuses(&[429, 201]);
        let chain = chain(transport.clone(), RetryOptions::fast());

        let response = chain
            .send(with_body(Method::POST, "https://h/charge", "{}"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_429_retried_for_get_and_keyed_post() {
        let transport = MockTransport::statuses(&[429, 200]);
        let response = chain(transport.clone(), RetryOptions::fast())
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 2);

        let transport = MockTransport::statuses(&[429, 201]);
        let mut request = with_body(Method::POST, "https://h/charge", "{}");
        request
            .headers_mut()
            .insert("idempotency-key", HeaderValue::from_static("k-2"));
        let response = chain(transport.clone(), RetryOptions::fast())
            .send(request, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_carries_last_response() {
        let transport = MockTransport::new(|_, _| {
            Ok(response_with(503, &[("x-attempt-marker", "m")], "unavailable"))
        });
        let chain = chain(transport.clone(), RetryOptions::fast().with_max_retries(2));

        let err = chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), 3);
        match err {
            HttpError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                match *last {
                    LastAttempt::Response {
                        status,
                        headers,
                        body,
                    } => {
                        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                        assert_eq!(headers["x-attempt-marker"], "m");
                        assert_eq!(&body[..], b"unavailable");
                    }
                    LastAttempt::Error(err) => panic!("expected response, got {err}"),
                }
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_errors_retried_then_exhausted() {
        let transport = MockTransport::new(|_, _| {
            Err(HttpError::Transport("connection reset".into()))
        });
        let chain = chain(transport.clone(), RetryOptions::fast().with_max_retries(1));

        let err = chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 2);
        assert!(matches!(
            err,
            HttpError::RetryExhausted { attempts: 2, ref last } if matches!(**last, LastAttempt::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_error_passes_through() {
        let transport = MockTransport::new(|_, _| {
            Err(HttpError::InvalidScheme {
                scheme: "ftp".to_owned(),
                reason: "no".to_owned(),
            })
        });
        let chain = chain(transport.clone(), RetryOptions::fast());

        let err = chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidScheme { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_streaming_body_fails_open() {
        let transport = MockTransport::statuses(&[429]);
        let chain = chain(transport.clone(), RetryOptions::fast());
        let mut request = streaming_post("https://h/upload");
        request
            .headers_mut()
            .insert("idempotency-key", HeaderValue::from_static("k-3"));

        let response = chain
            .send(request, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_is_honored() {
        let transport = MockTransport::new(|index, _| {
            Ok(if index == 0 {
                response_with(429, &[("retry-after", "1")], "")
            } else {
                response(200)
            })
        });
        let chain = chain(transport.clone(), RetryOptions::fast());

        let started = std::time::Instant::now();
        chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_total_timeout_caps_retries() {
        let transport = MockTransport::new(|_, _| Ok(response_with(503, &[("retry-after", "5")], "")));
        let options = RetryOptions::fast()
            .with_max_retries(10)
            .with_total_timeout(Duration::from_millis(100));
        let chain = chain(transport.clone(), options);

        let err = chain
            .send(get("https://h/x"), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::DeadlineExceeded(d) if d == Duration::from_millis(100)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_backoff_sleep_is_cancellable() {
        let transport = MockTransport::new(|_, _| Ok(response_with(503, &[("retry-after", "30")], "")));
        let chain = chain(transport.clone(), RetryOptions::fast());
        let token = CancellationToken::new();
        let ctx = RequestContext::new(OptionsBag::new(), token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = chain.send(get("https://h/x"), &ctx).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, HttpError::Cancelled));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_per_request_override_disables_retries() {
        let transport = MockTransport::statuses(&[503]);
        let chain = chain(transport.clone(), RetryOptions::fast());
        let ctx = RequestContext::new(
            OptionsBag::new().with(RetryOptions::disabled()),
            CancellationToken::new(),
        );

        let response = chain.send(get("https://h/x"), &ctx).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_replaces_defaults() {
        let transport = MockTransport::statuses(&[418, 200]);
        let options = RetryOptions::fast()
            .with_predicate(|decision| decision.trigger == RetryTrigger::Status(418));
        let chain = chain(transport.clone(), options);

        let response = chain
            .send(with_body(Method::POST, "https://h/x", "{}"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn test_calculate_backoff_growth_and_cap() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(calculate_backoff(&backoff, 0), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&backoff, 1), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&backoff, 2), Duration::from_millis(400));
        assert_eq!(calculate_backoff(&backoff, 3), Duration::from_millis(500));
        assert_eq!(calculate_backoff(&backoff, usize::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_calculate_backoff_jitter_bounds() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = calculate_backoff(&backoff, 0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_calculate_backoff_sanitizes_multiplier() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: f64::NAN,
            jitter: false,
        };
        assert_eq!(calculate_backoff(&backoff, 5), Duration::from_millis(10));
    }
}
