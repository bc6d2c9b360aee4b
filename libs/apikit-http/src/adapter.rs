//! Request adapter: descriptor in, typed result out.
//!
//! ```text
//! RequestDescriptor
//!   → authenticate (AuthenticationProvider)
//!   → native request
//!   → HandlerChain → Transport
//!   → [401 + claims challenge: re-authenticate a copy, resend once]
//!   → error mapping | NativeCapture | codec + serde
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};
use serde::de::DeserializeOwned;
use tracing::{Instrument, Span};

use crate::auth::{AuthContext, AuthenticationProvider, claims_from_challenge};
use crate::body::{NativeRequest, NativeResponse};
use crate::chain::{Handler, HandlerChain, RequestContext, default_handlers};
use crate::codec::{CodecRegistry, ParseNode};
use crate::config::{DEFAULT_MAX_BODY_SIZE, TransportConfig};
use crate::error::{ApiError, BoxError, HttpError};
use crate::headers::Headers;
use crate::request::{BASE_URL_PARAMETER, RequestDescriptor};
use crate::response::{NativeCapture, RequestOrigin, read_body_limited, sanitize_uri};
use crate::transport::{HyperTransport, Transport};
use crate::uri_template::{DefaultUriTemplateExpander, UriTemplateExpander};

/// Builds the error returned for a non-success status.
pub type ErrorFactory = Arc<dyn Fn(&ApiError) -> BoxError + Send + Sync>;

/// Per-status error factories.
///
/// Keys are an exact status code (`"404"`), a class (`"4XX"`, `"5XX"`) or
/// the catch-all `"XXX"`, looked up in that order.
#[derive(Clone, Default)]
pub struct ErrorMapping {
    factories: HashMap<String, ErrorFactory>,
}

impl fmt::Debug for ErrorMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<&String> = self.factories.keys().collect();
        codes.sort();
        f.debug_struct("ErrorMapping").field("codes", &codes).finish()
    }
}

impl ErrorMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(
        mut self,
        code: &str,
        factory: impl Fn(&ApiError) -> BoxError + Send + Sync + 'static,
    ) -> Self {
        self.insert(code, factory);
        self
    }

    pub fn insert(
        &mut self,
        code: &str,
        factory: impl Fn(&ApiError) -> BoxError + Send + Sync + 'static,
    ) {
        self.factories
            .insert(code.trim().to_ascii_uppercase(), Arc::new(factory));
    }

    /// Factory for `status`, if any key matches
    #[must_use]
    pub fn find(&self, status: StatusCode) -> Option<&ErrorFactory> {
        if let Some(factory) = self.factories.get(status.as_str()) {
            return Some(factory);
        }
        let class = match status.as_u16() {
            400..=499 => Some("4XX"),
            500..=599 => Some("5XX"),
            _ => None,
        };
        class
            .and_then(|class| self.factories.get(class))
            .or_else(|| self.factories.get("XXX"))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[derive(Clone)]
enum Codecs {
    Global,
    Owned(Arc<CodecRegistry>),
}

impl Codecs {
    fn registry(&self) -> &CodecRegistry {
        match self {
            Self::Global => CodecRegistry::global(),
            Self::Owned(registry) => registry,
        }
    }
}

/// Builder for [`RequestAdapter`].
pub struct RequestAdapterBuilder {
    authentication_provider: Option<Arc<dyn AuthenticationProvider>>,
    codecs: Option<Codecs>,
    handlers: Option<Vec<Arc<dyn Handler>>>,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    base_url: Option<String>,
    max_body_size: usize,
    uri_expander: Arc<dyn UriTemplateExpander>,
    tracing: bool,
}

impl Default for RequestAdapterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAdapterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            authentication_provider: None,
            codecs: None,
            handlers: None,
            transport: None,
            transport_config: TransportConfig::default(),
            base_url: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            uri_expander: Arc::new(DefaultUriTemplateExpander),
            tracing: true,
        }
    }

    /// Required
    #[must_use]
    pub fn authentication_provider(mut self, provider: Arc<dyn AuthenticationProvider>) -> Self {
        self.authentication_provider = Some(provider);
        self
    }

    /// Codec registry used for responses; required unless
    /// [`with_default_codecs`](Self::with_default_codecs) is called
    #[must_use]
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(Codecs::Owned(codecs));
        self
    }

    /// Use the process-wide [`CodecRegistry::global`]
    #[must_use]
    pub fn with_default_codecs(mut self) -> Self {
        self.codecs = Some(Codecs::Global);
        self
    }

    /// Handlers, outermost first. An empty list sends straight to the
    /// transport. Defaults to [`default_handlers`].
    #[must_use]
    pub fn handlers(mut self, handlers: Vec<Arc<dyn Handler>>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Terminal transport; replaces the default [`HyperTransport`]
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configuration of the default transport; ignored when a transport is set
    #[must_use]
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Largest response body the adapter reads (default: 10 MB)
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    #[must_use]
    pub fn uri_expander(mut self, expander: Arc<dyn UriTemplateExpander>) -> Self {
        self.uri_expander = expander;
        self
    }

    /// Open an `outgoing_request` span per call (default: true)
    #[must_use]
    pub fn tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    /// # Errors
    /// Returns `HttpError::Configuration` when the authentication provider or
    /// the codec registry is missing, or the transport error when the default
    /// transport cannot be created.
    pub fn build(self) -> Result<RequestAdapter, HttpError> {
        let authentication_provider = self.authentication_provider.ok_or_else(|| {
            HttpError::Configuration("an authentication provider is required".to_owned())
        })?;
        let codecs = self
            .codecs
            .ok_or_else(|| HttpError::Configuration("a codec registry is required".to_owned()))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(&self.transport_config)?),
        };
        let handlers = self.handlers.unwrap_or_else(default_handlers);
        let chain = HandlerChain::new(transport, handlers);
        tracing::debug!(handlers = ?chain.handler_names(), "Built request adapter");

        Ok(RequestAdapter {
            authentication_provider,
            codecs,
            chain,
            base_url: ArcSwapOption::from(self.base_url.map(|url| Arc::new(trim_base_url(url)))),
            max_body_size: self.max_body_size,
            uri_expander: self.uri_expander,
            tracing: self.tracing,
        })
    }
}

fn trim_base_url(url: String) -> String {
    if url.ends_with('/') {
        url.trim_end_matches('/').to_owned()
    } else {
        url
    }
}

/// Sends request descriptors and resolves their responses.
///
/// Share one adapter per API through an `Arc`; every call gets its own
/// [`RequestContext`].
pub struct RequestAdapter {
    authentication_provider: Arc<dyn AuthenticationProvider>,
    codecs: Codecs,
    chain: HandlerChain,
    base_url: ArcSwapOption<String>,
    max_body_size: usize,
    uri_expander: Arc<dyn UriTemplateExpander>,
    tracing: bool,
}

impl fmt::Debug for RequestAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAdapter")
            .field("chain", &self.chain)
            .field("base_url", &self.base_url())
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

/// Successful body with its content type
struct Payload {
    content_type: String,
    body: Bytes,
}

impl RequestAdapter {
    #[must_use]
    pub fn builder() -> RequestAdapterBuilder {
        RequestAdapterBuilder::new()
    }

    #[must_use]
    pub fn base_url(&self) -> Option<String> {
        self.base_url.load_full().map(|url| url.as_ref().clone())
    }

    /// Base URL injected as the `baseurl` path parameter; trailing slashes
    /// are removed.
    pub fn set_base_url(&self, base_url: impl Into<String>) {
        self.base_url
            .store(Some(Arc::new(trim_base_url(base_url.into()))));
    }

    #[must_use]
    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        self.codecs.registry()
    }

    /// Send and deserialize the response into `T`.
    ///
    /// Returns `None` for 204, an empty body, a response without content
    /// type, or when a [`NativeCapture`] is attached.
    ///
    /// # Errors
    /// Returns the mapped or generic API error for non-success statuses,
    /// `HttpError::UnsupportedContentType` when no codec matches, and any
    /// error raised while sending.
    pub async fn send<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<Option<T>, HttpError> {
        let Some(node) = self.send_for_node(descriptor, errors).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(node)?))
    }

    /// Send and deserialize the response into a list of `T`.
    ///
    /// # Errors
    /// As [`send`](Self::send); a payload that is not a list fails with
    /// `HttpError::Json`.
    pub async fn send_collection<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<Option<Vec<T>>, HttpError> {
        self.send::<Vec<T>>(descriptor, errors).await
    }

    /// Send and read a scalar.
    ///
    /// Text payloads holding a number or boolean (`42`, `true`) are parsed
    /// into the requested type.
    ///
    /// # Errors
    /// As [`send`](Self::send).
    pub async fn send_primitive<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<Option<T>, HttpError> {
        let Some(node) = self.send_for_node(descriptor, errors).await? else {
            return Ok(None);
        };
        match node {
            ParseNode::String(text) => match serde_json::from_value(ParseNode::String(text.clone())) {
                Ok(value) => Ok(Some(value)),
                Err(err) => serde_json::from_str(text.trim())
                    .map(Some)
                    .map_err(|_| HttpError::Json(err)),
            },
            other => Ok(Some(serde_json::from_value(other)?)),
        }
    }

    /// Send and return the raw response body.
    ///
    /// # Errors
    /// As [`send`](Self::send), without codec selection.
    pub async fn send_bytes(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<Option<Bytes>, HttpError> {
        Ok(self
            .send_for_payload(descriptor, errors)
            .await?
            .map(|payload| payload.body))
    }

    /// Send and discard the response body.
    ///
    /// # Errors
    /// Returns the mapped or generic API error for non-success statuses and
    /// any error raised while sending.
    pub async fn send_no_content(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<(), HttpError> {
        let capture = descriptor.native_capture().cloned();
        let response = self.execute(descriptor).await?;
        let response = self.check_status(response, errors).await?;
        if let Some(capture) = capture {
            capture.store(response);
        }
        Ok(())
    }

    /// Authenticate `descriptor` and build the request the chain would see.
    ///
    /// # Errors
    /// Returns URI expansion errors, `HttpError::Authentication`, or request
    /// build errors.
    pub async fn convert_to_native_request(
        &self,
        mut descriptor: RequestDescriptor,
    ) -> Result<NativeRequest, HttpError> {
        self.resolve_url(&mut descriptor)?;
        let ctx = RequestContext::new(descriptor.options().clone(), descriptor.cancellation().clone());
        self.authenticate(&mut descriptor, &AuthContext::new(), &ctx)
            .await?;
        to_native_request(&mut descriptor)
    }

    fn resolve_url(&self, descriptor: &mut RequestDescriptor) -> Result<(), HttpError> {
        if !descriptor.path_parameters.contains_key(BASE_URL_PARAMETER)
            && let Some(base_url) = self.base_url.load_full()
        {
            descriptor.add_path_parameter(BASE_URL_PARAMETER, base_url.as_str());
        }
        let url = descriptor.uri_with(self.uri_expander.as_ref())?;
        descriptor.set_url(url);
        Ok(())
    }

    async fn authenticate(
        &self,
        descriptor: &mut RequestDescriptor,
        auth: &AuthContext,
        ctx: &RequestContext,
    ) -> Result<(), HttpError> {
        ctx.run_cancellable(async {
            self.authentication_provider
                .authenticate_request(descriptor, auth)
                .await
                .map_err(HttpError::Authentication)
        })
        .await
    }

    fn call_span(&self, request: &NativeRequest) -> Span {
        if !self.tracing {
            return Span::none();
        }
        tracing::info_span!(
            "outgoing_request",
            http.method = %request.method(),
            http.url = %sanitize_uri(request.uri()),
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    }

    /// Run one logical call, including the claims-challenge resend.
    async fn execute(&self, mut descriptor: RequestDescriptor) -> Result<NativeResponse, HttpError> {
        self.resolve_url(&mut descriptor)?;
        let ctx = RequestContext::new(descriptor.options().clone(), descriptor.cancellation().clone());
        self.authenticate(&mut descriptor, &AuthContext::new(), &ctx)
            .await?;

        descriptor.make_replayable(ctx.cancellation()).await?;
        let replay = descriptor.try_clone();
        let request = to_native_request(&mut descriptor)?;
        let span = self.call_span(&request);
        let ctx = ctx.with_span(span.clone());

        let result = async {
            let response = self.chain.send(request, &ctx).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            let Some(claims) = claims_from_challenge(response.headers()) else {
                return Ok(response);
            };
            let Some(mut retry) = replay else {
                tracing::debug!("Claims challenge on a non-replayable request; returning 401");
                return Ok(response);
            };

            tracing::debug!("Claims challenge received; re-authenticating once");
            self.authenticate(&mut retry, &AuthContext::with_claims(claims), &ctx)
                .await?;
            let request = to_native_request(&mut retry)?;
            self.chain.send(request, &ctx).await
        }
        .instrument(span.clone())
        .await;

        match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                if !response.status().is_success() {
                    span.record("error", true);
                }
            }
            Err(_) => {
                span.record("error", true);
            }
        }
        result
    }

    /// Pass success responses through; turn the others into errors.
    async fn check_status(
        &self,
        response: NativeResponse,
        errors: Option<&ErrorMapping>,
    ) -> Result<NativeResponse, HttpError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let origin = RequestOrigin::from_response(&response)
            .map(|origin| (origin.method.clone(), origin.sanitized_uri()));
        let (parts, body) = response.into_parts();
        let body = read_body_limited(body, self.max_body_size).await?;
        let api = ApiError {
            status: parts.status,
            headers: Headers::from(parts.headers),
            body,
            method: origin.as_ref().map(|(method, _)| method.clone()),
            url: origin.map(|(_, url)| url),
        };

        match errors.and_then(|mapping| mapping.find(api.status)) {
            Some(factory) => Err(HttpError::MappedStatus {
                status: api.status,
                source: factory(&api),
            }),
            None => Err(api.into()),
        }
    }

    async fn send_for_payload(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<Option<Payload>, HttpError> {
        let capture = descriptor.native_capture().cloned();
        let response = self.execute(descriptor).await?;
        let response = self.check_status(response, errors).await?;

        if let Some(capture) = capture {
            capture.store(response);
            return Ok(None);
        }
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let Some(content_type) = content_type(response.headers().get(header::CONTENT_TYPE)) else {
            return Ok(None);
        };

        let body = read_body_limited(response.into_body(), self.max_body_size).await?;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(Payload { content_type, body }))
    }

    async fn send_for_node(
        &self,
        descriptor: RequestDescriptor,
        errors: Option<&ErrorMapping>,
    ) -> Result<Option<ParseNode>, HttpError> {
        let Some(Payload { content_type, body }) = self.send_for_payload(descriptor, errors).await?
        else {
            return Ok(None);
        };
        let codec = self.codecs().get(&content_type)?;
        let node = codec
            .parse(&body)
            .map_err(|source| HttpError::Codec {
                content_type: content_type.clone(),
                source,
            })?;
        Ok(Some(node))
    }
}

fn content_type(value: Option<&HeaderValue>) -> Option<String> {
    value
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Build the native request from a descriptor whose URL is resolved.
///
/// Takes the body out of `descriptor`. `Content-Length` is set when the body
/// length is known and the body is not empty.
fn to_native_request(descriptor: &mut RequestDescriptor) -> Result<NativeRequest, HttpError> {
    let url = descriptor.uri()?;
    let body = descriptor.take_body();
    let length = body.content_length().filter(|_| !body.is_empty());

    let mut request = http::Request::builder()
        .method(descriptor.method.clone())
        .uri(url.as_str())
        .body(body)?;
    *request.headers_mut() = descriptor.headers.as_header_map().clone();
    if let Some(length) = length
        && !request.headers().contains_key(header::CONTENT_LENGTH)
    {
        request
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(request)
}
