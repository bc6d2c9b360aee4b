use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderValue, StatusCode, header};
use tracing::Instrument;
use url::Url;

use crate::auth::{AccessTokenProvider, AuthContext, bearer_value, claims_from_challenge};
use crate::body::{NativeRequest, NativeResponse, snapshot_for_replay};
use crate::chain::{Handler, Next, RequestContext};
use crate::error::{HttpError, InvalidUriKind};

/// Adds a bearer token at the chain level.
///
/// Requests that already carry `Authorization` pass through untouched. A 401
/// carrying a claims challenge is answered once with a token obtained for
/// those claims, provided the request can be replayed.
#[derive(Clone)]
pub struct AuthorizationHandler {
    token_provider: Arc<dyn AccessTokenProvider>,
}

impl std::fmt::Debug for AuthorizationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationHandler").finish_non_exhaustive()
    }
}

impl AuthorizationHandler {
    pub fn new(token_provider: Arc<dyn AccessTokenProvider>) -> Self {
        Self { token_provider }
    }

    async fn authorize(
        &self,
        request: &mut NativeRequest,
        auth: &AuthContext,
        ctx: &RequestContext,
    ) -> Result<(), HttpError> {
        let target = request.uri().to_string();
        let url = Url::parse(&target).map_err(|err| HttpError::InvalidUri {
            url: target.clone(),
            kind: InvalidUriKind::ParseError,
            reason: err.to_string(),
        })?;

        let token = ctx
            .run_cancellable(async {
                self.token_provider
                    .get_authorization_token(&url, auth)
                    .await
                    .map_err(HttpError::Authentication)
            })
            .await?;

        match token {
            Some(token) if !token.is_empty() => {
                let mut value = HeaderValue::from_str(&bearer_value(&token))?;
                value.set_sensitive(true);
                request.headers_mut().insert(header::AUTHORIZATION, value);
            }
            _ => {
                tracing::debug!(host = ?url.host_str(), "No token for destination; sending unauthenticated");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for AuthorizationHandler {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn handle(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        if request.headers().contains_key(header::AUTHORIZATION) {
            return next.run(request, ctx).await;
        }
        let span = ctx.handler_span(self.name());

        async move {
            let (mut request, original) = snapshot_for_replay(request, ctx.cancellation()).await?;
            self.authorize(&mut request, &AuthContext::new(), ctx).await?;

            let response = next.run(request, ctx).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            let Some(claims) = claims_from_challenge(response.headers()) else {
                return Ok(response);
            };
            let Some(original) = original else {
                tracing::debug!("Claims challenge on a non-replayable request; returning 401");
                return Ok(response);
            };

            tracing::debug!("Claims challenge received; resending with a new token");
            let mut retry = original.to_request();
            retry.headers_mut().remove(header::AUTHORIZATION);
            self.authorize(&mut retry, &AuthContext::with_claims(claims), ctx)
                .await?;
            next.run(retry, ctx).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, AllowedHostsValidator, StaticAccessTokenProvider};
    use crate::chain::HandlerChain;
    use crate::error::BoxError;
    use crate::testing::{MockTransport, get, response, response_with, streaming_post};
    use parking_lot::Mutex;

    const CHALLENGE: &str =
        r#"Bearer authorization_uri="https://login.example.com", error="insufficient_claims", claims="eyJhY2Nlc3NfdG9rZW4iOnt9fQ==""#;

    /// Hands out `tok-<n>` and records every context it sees
    #[derive(Default)]
    struct RecordingProvider {
        contexts: Mutex<Vec<AuthContext>>,
        hosts: AllowedHostsValidator,
    }

    #[async_trait]
    impl AccessTokenProvider for RecordingProvider {
        async fn get_authorization_token(
            &self,
            _url: &Url,
            context: &AuthContext,
        ) -> Result<Option<AccessToken>, BoxError> {
            let mut contexts = self.contexts.lock();
            contexts.push(context.clone());
            Ok(Some(AccessToken::new(format!("tok-{}", contexts.len()))))
        }

        fn allowed_hosts_validator(&self) -> &AllowedHostsValidator {
            &self.hosts
        }
    }

    struct FailingProvider(AllowedHostsValidator);

    #[async_trait]
    impl AccessTokenProvider for FailingProvider {
        async fn get_authorization_token(
            &self,
            _url: &Url,
            _context: &AuthContext,
        ) -> Result<Option<AccessToken>, BoxError> {
            Err("token endpoint unreachable".into())
        }

        fn allowed_hosts_validator(&self) -> &AllowedHostsValidator {
            &self.0
        }
    }

    fn chain(transport: Arc<MockTransport>, provider: Arc<dyn AccessTokenProvider>) -> HandlerChain {
        HandlerChain::new(transport, vec![Arc::new(AuthorizationHandler::new(provider))])
    }

    fn challenge_then_ok() -> Arc<MockTransport> {
        MockTransport::new(|index, _| {
            Ok(if index == 0 {
                response_with(401, &[("www-authenticate", CHALLENGE)], "")
            } else {
                response(200)
            })
        })
    }

    #[tokio::test]
    async fn test_adds_bearer_header() {
        let transport = MockTransport::ok();
        let chain = chain(
            transport.clone(),
            Arc::new(StaticAccessTokenProvider::new("secret")),
        );

        chain
            .send(get("https://graph.example.com/me"), &RequestContext::default())
            .await
            .unwrap();

        let seen = transport.requests();
        let value = &seen[0].headers[header::AUTHORIZATION];
        assert_eq!(value, "Bearer secret");
        assert!(value.is_sensitive());
    }

    #[tokio::test]
    async fn test_pre_authorized_request_untouched() {
        let transport = MockTransport::ok();
        let provider = Arc::new(RecordingProvider::default());
        let chain = chain(transport.clone(), provider.clone());
        let mut request = get("https://graph.example.com/me");
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));

        chain.send(request, &RequestContext::default()).await.unwrap();

        assert_eq!(transport.requests()[0].headers[header::AUTHORIZATION], "Basic abc");
        assert!(provider.contexts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_host_sends_without_token() {
        let transport = MockTransport::ok();
        let provider = StaticAccessTokenProvider::new("secret")
            .with_allowed_hosts(AllowedHostsValidator::new(["graph.example.com"]).unwrap());
        let chain = chain(transport.clone(), Arc::new(provider));

        chain
            .send(get("https://evil.example.net/steal"), &RequestContext::default())
            .await
            .unwrap();
        assert!(!transport.requests()[0].headers.contains_key(header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_claims_challenge_resends_once_with_claims() {
        let transport = challenge_then_ok();
        let provider = Arc::new(RecordingProvider::default());
        let chain = chain(transport.clone(), provider.clone());

        let response = chain
            .send(get("https://graph.example.com/me"), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let seen = transport.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].headers[header::AUTHORIZATION], "Bearer tok-1");
        assert_eq!(seen[1].headers[header::AUTHORIZATION], "Bearer tok-2");

        let contexts = provider.contexts.lock();
        assert_eq!(contexts[0].claims, None);
        assert_eq!(contexts[1].claims.as_deref(), Some("eyJhY2Nlc3NfdG9rZW4iOnt9fQ=="));
    }

    #[tokio::test]
    async fn test_repeated_challenge_is_not_retried_twice() {
        let transport = MockTransport::new(|_, _| {
            Ok(response_with(401, &[("www-authenticate", CHALLENGE)], ""))
        });
        let chain = chain(transport.clone(), Arc::new(RecordingProvider::default()));

        let response = chain
            .send(get("https://graph.example.com/me"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_401_without_claims_returned() {
        let transport = MockTransport::new(|_, _| {
            Ok(response_with(401, &[("www-authenticate", r#"Bearer realm="api""#)], ""))
        });
        let chain = chain(transport.clone(), Arc::new(RecordingProvider::default()));

        let response = chain
            .send(get("https://graph.example.com/me"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_streaming_request_not_resent() {
        let transport = challenge_then_ok();
        let chain = chain(transport.clone(), Arc::new(RecordingProvider::default()));

        let response = chain
            .send(streaming_post("https://graph.example.com/upload"), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_authentication_error() {
        let transport = MockTransport::ok();
        let chain = chain(
            transport.clone(),
            Arc::new(FailingProvider(AllowedHostsValidator::default())),
        );

        let err = chain
            .send(get("https://graph.example.com/me"), &RequestContext::default())
            .await
            .unwrap_err();
        match err {
            HttpError::Authentication(source) => {
                assert_eq!(source.to_string(), "token endpoint unreachable");
            }
            other => panic!("expected Authentication, got {other:?}"),
        }
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_plain_http_refused_by_static_provider() {
        let transport = MockTransport::ok();
        let chain = chain(
            transport.clone(),
            Arc::new(StaticAccessTokenProvider::new("secret")),
        );

        let err = chain
            .send(get("http://graph.example.com/me"), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Authentication(_)));
    }
}
