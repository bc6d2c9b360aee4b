#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Request delivery runtime for generated API clients
//!
//! This crate turns a [`RequestDescriptor`] into wire traffic and the wire
//! response back into a typed model or a raw capture:
//! - [`RequestAdapter`] builds the native request, authenticates it and
//!   resolves the response through a [`CodecRegistry`]
//! - [`HandlerChain`] runs an ordered list of [`Handler`]s in front of a
//!   [`Transport`]
//! - per-request [`OptionsBag`] values override handler defaults for one call
//!
//! Built-in handlers cover bearer authorization with claims challenges,
//! redirects, retries with backoff, fault injection, query parameter name
//! decoding, `User-Agent` and telemetry enrichment, and header inspection.
//!
//! The default transport is a pooled hyper client over rustls with
//! transparent decompression and a per-attempt timeout. Plain HTTP is
//! rejected unless [`TransportSecurity::AllowInsecureHttp`] is configured.
//!
//! # Example
//!
//! ```ignore
//! use apikit_http::{
//!     BaseBearerTokenAuthenticationProvider, RequestAdapter, RequestDescriptor,
//!     StaticAccessTokenProvider,
//! };
//! use std::sync::Arc;
//!
//! let auth = BaseBearerTokenAuthenticationProvider::new(Arc::new(
//!     StaticAccessTokenProvider::new(token),
//! ));
//! let adapter = RequestAdapter::builder()
//!     .authentication_provider(Arc::new(auth))
//!     .with_default_codecs()
//!     .base_url("https://api.example.com/v1")
//!     .build()?;
//!
//! let mut request = RequestDescriptor::new(http::Method::GET, "{+baseurl}/users/{id}");
//! request.add_path_parameter("id", 42);
//! let user: Option<User> = adapter.send(request, None).await?;
//! ```

mod adapter;
pub mod auth;
mod body;
mod chain;
pub mod codec;
mod config;
mod error;
pub mod handlers;
mod headers;
mod options;
mod request;
mod response;
#[cfg(test)]
mod testing;
mod transport;
mod uri_template;

pub use adapter::{ErrorFactory, ErrorMapping, RequestAdapter, RequestAdapterBuilder};
pub use auth::{
    AccessToken, AccessTokenProvider, AllowedHostsValidator, AnonymousAuthenticationProvider,
    AuthContext, AuthenticationProvider, BaseBearerTokenAuthenticationProvider,
    StaticAccessTokenProvider,
};
pub use body::{
    NativeRequest, NativeResponse, ReplayRequest, RequestBody, ResponseBody, empty_body, full_body,
    snapshot_for_replay,
};
pub use chain::{Handler, HandlerChain, Next, RequestContext, default_handlers};
pub use codec::{Codec, CodecRegistry, ParseNode};
pub use config::{
    ChaosFault, ChaosOptions, ChaosSelector, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_REDIRECTS,
    DEFAULT_PRODUCT_NAME, DEFAULT_PRODUCT_VERSION, ExponentialBackoff, HeadersInspectionOptions,
    IDEMPOTENCY_KEY_HEADER, ParametersNameDecodingOptions, RedirectOptions, RedirectPredicate,
    RequestEnricher, RetryDecision, RetryOptions, RetryPredicate, RetryTrigger, TelemetryOptions,
    TlsRootConfig, TransportConfig, TransportSecurity, UserAgentOptions, default_chaos_faults,
    is_idempotent_method,
};
pub use error::{ApiError, BoxError, HttpError, InvalidUriKind, LastAttempt};
pub use handlers::{
    AuthorizationHandler, ChaosHandler, HeadersInspectionHandler, ParametersNameDecodingHandler,
    RETRY_ATTEMPT_HEADER, RedirectHandler, RetryHandler, TelemetryHandler, UserAgentHandler,
};
pub use headers::Headers;
pub use options::{HandlerOption, OptionKind, OptionsBag, RequestOption};
pub use request::{BASE_URL_PARAMETER, ParameterValue, RequestDescriptor};
pub use response::{
    NativeCapture, RequestOrigin, drain_body, parse_retry_after, read_body_limited, sanitize_uri,
};
pub use transport::{HyperTransport, ServiceTransport, Transport};
pub use uri_template::{DefaultUriTemplateExpander, UriTemplateExpander};
