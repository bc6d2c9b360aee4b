//! Request authentication.
//!
//! [`AuthenticationProvider`] authenticates a descriptor before it is
//! converted; [`AccessTokenProvider`] supplies bearer tokens for a URL and
//! owns the host allow-list. Token acquisition and caching stay inside the
//! token provider.

mod challenge;
mod hosts;
mod provider;
mod token;

use std::collections::BTreeMap;

pub use challenge::claims_from_challenge;
pub use hosts::AllowedHostsValidator;
pub use provider::{
    AccessTokenProvider, AnonymousAuthenticationProvider, AuthenticationProvider,
    BaseBearerTokenAuthenticationProvider, StaticAccessTokenProvider,
};
pub use token::AccessToken;

pub(crate) use provider::bearer_value;

/// Additional context passed to a provider for one authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Claims from a `WWW-Authenticate` challenge, as received
    pub claims: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl AuthContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_claims(claims: impl Into<String>) -> Self {
        Self {
            claims: Some(claims.into()),
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}
