use std::sync::Arc;

use async_trait::async_trait;
use url::Url;
use zeroize::Zeroizing;

use super::{AccessToken, AllowedHostsValidator, AuthContext};
use crate::error::{BoxError, HttpError};
use crate::request::RequestDescriptor;

/// Authenticates a request descriptor.
///
/// Errors are propagated to the caller verbatim, wrapped in
/// `HttpError::Authentication`.
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    /// # Errors
    /// Returns the provider's own error when authentication fails.
    async fn authenticate_request(
        &self,
        request: &mut RequestDescriptor,
        context: &AuthContext,
    ) -> Result<(), BoxError>;
}

/// Supplies bearer tokens for a destination URL.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Token for `url`, or `None` when no token should be sent there.
    ///
    /// # Errors
    /// Returns the provider's own error when acquisition fails.
    async fn get_authorization_token(
        &self,
        url: &Url,
        context: &AuthContext,
    ) -> Result<Option<AccessToken>, BoxError>;

    fn allowed_hosts_validator(&self) -> &AllowedHostsValidator;
}

/// Provider that leaves requests unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthenticationProvider;

#[async_trait]
impl AuthenticationProvider for AnonymousAuthenticationProvider {
    async fn authenticate_request(
        &self,
        _request: &mut RequestDescriptor,
        _context: &AuthContext,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// `Bearer` header value, zeroed on drop.
pub(crate) fn bearer_value(token: &AccessToken) -> Zeroizing<String> {
    let mut value = Zeroizing::new(String::with_capacity(7 + token.expose().len()));
    value.push_str("Bearer ");
    value.push_str(token.expose());
    value
}

/// Sets `Authorization: Bearer <token>` from an [`AccessTokenProvider`].
///
/// A request that already carries an `Authorization` header is left alone,
/// unless the context carries claims, in which case the old header is
/// replaced with a token obtained for those claims.
#[derive(Clone)]
pub struct BaseBearerTokenAuthenticationProvider {
    token_provider: Arc<dyn AccessTokenProvider>,
}

impl std::fmt::Debug for BaseBearerTokenAuthenticationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseBearerTokenAuthenticationProvider")
            .field(
                "allowed_hosts",
                &self.token_provider.allowed_hosts_validator().allowed_hosts(),
            )
            .finish()
    }
}

impl BaseBearerTokenAuthenticationProvider {
    pub fn new(token_provider: Arc<dyn AccessTokenProvider>) -> Self {
        Self { token_provider }
    }

    #[must_use]
    pub fn token_provider(&self) -> &Arc<dyn AccessTokenProvider> {
        &self.token_provider
    }
}

#[async_trait]
impl AuthenticationProvider for BaseBearerTokenAuthenticationProvider {
    async fn authenticate_request(
        &self,
        request: &mut RequestDescriptor,
        context: &AuthContext,
    ) -> Result<(), BoxError> {
        let authorization = http::header::AUTHORIZATION.as_str();
        if context.claims.is_some() {
            request.headers.remove(authorization);
        }
        if request.headers.contains(authorization) {
            return Ok(());
        }

        let url = request.uri()?;
        let Some(token) = self
            .token_provider
            .get_authorization_token(&url, context)
            .await?
        else {
            tracing::debug!(host = ?url.host_str(), "No token for destination; sending unauthenticated");
            return Ok(());
        };
        if token.is_empty() {
            return Ok(());
        }

        request
            .headers
            .insert_sensitive(authorization, &bearer_value(&token))?;
        Ok(())
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Token provider returning one fixed token.
///
/// Honors the allow-list and refuses to hand the token to non-https
/// destinations other than loopback hosts.
#[derive(Debug, Clone)]
pub struct StaticAccessTokenProvider {
    token: AccessToken,
    allowed_hosts: AllowedHostsValidator,
}

impl StaticAccessTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(token),
            allowed_hosts: AllowedHostsValidator::default(),
        }
    }

    #[must_use]
    pub fn with_allowed_hosts(mut self, allowed_hosts: AllowedHostsValidator) -> Self {
        self.allowed_hosts = allowed_hosts;
        self
    }
}

#[async_trait]
impl AccessTokenProvider for StaticAccessTokenProvider {
    async fn get_authorization_token(
        &self,
        url: &Url,
        _context: &AuthContext,
    ) -> Result<Option<AccessToken>, BoxError> {
        if !self.allowed_hosts.is_url_host_valid(url) {
            tracing::warn!(host = ?url.host_str(), "Destination host is not allow-listed; token withheld");
            return Ok(None);
        }
        if url.scheme() != "https" && !is_loopback(url) {
            return Err(Box::new(HttpError::InvalidScheme {
                scheme: url.scheme().to_owned(),
                reason: "bearer tokens are only sent over https".to_owned(),
            }));
        }
        Ok(Some(self.token.clone()))
    }

    fn allowed_hosts_validator(&self) -> &AllowedHostsValidator {
        &self.allowed_hosts
    }
}
