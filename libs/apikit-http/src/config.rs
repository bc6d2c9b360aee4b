use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use parking_lot::Mutex;

use crate::body::NativeRequest;
use crate::headers::Headers;

/// Product name appended to `User-Agent` by default
pub const DEFAULT_PRODUCT_NAME: &str = "apikit-http";

/// Product version appended to `User-Agent` by default
pub const DEFAULT_PRODUCT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Standard idempotency key header name (display form)
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Lowercase idempotency key header for `HeaderName` construction
const IDEMPOTENCY_KEY_HEADER_LOWER: &str = "idempotency-key";

/// Default maximum number of redirects followed per call
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default maximum response body size read by the adapter (10 MB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Default drain limit for response bodies before retry (64 KiB)
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Decides whether a redirect response is followed at all.
pub type RedirectPredicate = Arc<dyn Fn(StatusCode, &HeaderMap) -> bool + Send + Sync>;

/// Replaces the default retry eligibility policy.
pub type RetryPredicate = Arc<dyn Fn(&RetryDecision) -> bool + Send + Sync>;

/// Deterministic fault selection; `Some` injects the returned fault.
pub type ChaosSelector = Arc<dyn Fn(&NativeRequest) -> Option<ChaosFault> + Send + Sync>;

/// Caller-supplied request enrichment.
pub type RequestEnricher = Arc<dyn Fn(&mut NativeRequest) + Send + Sync>;

/// Redirect handler options.
#[derive(Clone)]
pub struct RedirectOptions {
    /// Maximum number of redirects followed per call (default: 5)
    ///
    /// Exceeding it fails the call with `HttpError::TooManyRedirects`.
    pub max_redirects: usize,

    /// Follow redirects that change the URL scheme (default: false)
    pub allow_scheme_change: bool,

    /// Optional predicate; when it returns false the redirect response is
    /// handed back to the caller unchanged.
    pub should_redirect: Option<RedirectPredicate>,
}

impl Default for RedirectOptions {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            allow_scheme_change: false,
            should_redirect: None,
        }
    }
}

impl fmt::Debug for RedirectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedirectOptions")
            .field("max_redirects", &self.max_redirects)
            .field("allow_scheme_change", &self.allow_scheme_change)
            .field("should_redirect", &self.should_redirect.is_some())
            .finish()
    }
}

impl RedirectOptions {
    /// Redirect responses are returned to the caller as-is
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            should_redirect: Some(Arc::new(|_, _| false)),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    #[must_use]
    pub fn with_scheme_change(mut self, allow: bool) -> Self {
        self.allow_scheme_change = allow;
        self
    }

    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(StatusCode, &HeaderMap) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_redirect = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn allows(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        self.should_redirect
            .as_ref()
            .is_none_or(|predicate| predicate(status, headers))
    }
}

/// Conditions that trigger a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// Transport-level errors (connection refused, DNS failure, reset, etc.)
    TransportError,
    /// Per-attempt timeout
    Timeout,
    /// Specific HTTP status code
    Status(u16),
    /// Error that is never retryable (e.g., `DeadlineExceeded`, `Cancelled`)
    NonRetryable,
}

impl RetryTrigger {
    pub const TOO_MANY_REQUESTS: Self = Self::Status(429);
    pub const REQUEST_TIMEOUT: Self = Self::Status(408);
    pub const INTERNAL_SERVER_ERROR: Self = Self::Status(500);
    pub const BAD_GATEWAY: Self = Self::Status(502);
    pub const SERVICE_UNAVAILABLE: Self = Self::Status(503);
    pub const GATEWAY_TIMEOUT: Self = Self::Status(504);
}

/// Check if HTTP method is idempotent (safe to retry) per RFC 9110.
///
/// Idempotent methods: GET, HEAD, PUT, DELETE, OPTIONS, TRACE.
/// Non-idempotent methods: POST, PATCH.
#[must_use]
pub fn is_idempotent_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// Exponential backoff configuration for retries
///
/// Computes delay as: `min(initial * multiplier^attempt, max)` with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 10s)
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Add a random 0-25% to each delay (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Fast backoff for testing (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Input of a custom retry predicate.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    /// Zero-based index of the attempt that just finished
    pub attempt: usize,
    pub method: Method,
    pub trigger: RetryTrigger,
    pub has_idempotency_key: bool,
}

/// Retry handler options.
///
/// Retry decisions are based on two sets of triggers:
/// - `always_retry`: retried regardless of HTTP method
/// - `idempotent_retry`: retried only for idempotent methods, or when the
///   request carries the idempotency key header
///
/// A `should_retry` predicate, when set, replaces both sets.
#[derive(Clone)]
pub struct RetryOptions {
    /// Maximum number of retries after the initial attempt (default: 3)
    pub max_retries: usize,

    pub backoff: ExponentialBackoff,

    /// Triggers retried for every method (default: empty)
    pub always_retry: HashSet<RetryTrigger>,

    /// Default: `[TransportError, Timeout, Status(408), Status(429), Status(500), Status(502), Status(503), Status(504)]`
    pub idempotent_retry: HashSet<RetryTrigger>,

    pub should_retry: Option<RetryPredicate>,

    /// Ignore `Retry-After` and always use the backoff policy (default: false)
    pub ignore_retry_after: bool,

    /// Deadline spanning every attempt and backoff delay (default: none)
    pub total_timeout: Option<Duration>,

    /// Header that makes non-idempotent requests eligible for `idempotent_retry`
    pub idempotency_key_header: Option<header::HeaderName>,

    /// Bytes read from a retryable response body before it is discarded,
    /// and kept when retries are exhausted (default: 64 KiB)
    pub drain_limit: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            always_retry: HashSet::new(),
            idempotent_retry: HashSet::from([
                RetryTrigger::TransportError,
                RetryTrigger::Timeout,
                RetryTrigger::REQUEST_TIMEOUT,
                RetryTrigger::TOO_MANY_REQUESTS,
                RetryTrigger::INTERNAL_SERVER_ERROR,
                RetryTrigger::BAD_GATEWAY,
                RetryTrigger::SERVICE_UNAVAILABLE,
                RetryTrigger::GATEWAY_TIMEOUT,
            ]),
            should_retry: None,
            ignore_retry_after: false,
            total_timeout: None,
            idempotency_key_header: Some(header::HeaderName::from_static(
                IDEMPOTENCY_KEY_HEADER_LOWER,
            )),
            drain_limit: DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("always_retry", &self.always_retry)
            .field("idempotent_retry", &self.idempotent_retry)
            .field("should_retry", &self.should_retry.is_some())
            .field("ignore_retry_after", &self.ignore_retry_after)
            .field("total_timeout", &self.total_timeout)
            .field("idempotency_key_header", &self.idempotency_key_header)
            .field("drain_limit", &self.drain_limit)
            .finish()
    }
}

impl RetryOptions {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Default triggers with fast, jitter-free backoff
    #[must_use]
    pub fn fast() -> Self {
        Self {
            backoff: ExponentialBackoff::fast(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout);
        self
    }

    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&RetryDecision) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Check if the given outcome should be retried
    #[must_use]
    pub fn should_retry(&self, decision: &RetryDecision) -> bool {
        if decision.trigger == RetryTrigger::NonRetryable {
            return false;
        }
        if let Some(predicate) = &self.should_retry {
            return predicate(decision);
        }
        if self.always_retry.contains(&decision.trigger) {
            return true;
        }
        self.idempotent_retry.contains(&decision.trigger)
            && (is_idempotent_method(&decision.method) || decision.has_idempotency_key)
    }
}

/// A synthetic response produced by the chaos handler.
#[derive(Debug, Clone)]
pub struct ChaosFault {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ChaosFault {
    /// JSON error fault with an optional `Retry-After` in seconds
    #[must_use]
    pub fn json(status: StatusCode, code: &str, retry_after: Option<u32>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(seconds) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": "A fault was injected by the chaos handler",
            }
        });
        Self {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }
}

/// Faults injected when no explicit list is configured
#[must_use]
pub fn default_chaos_faults() -> Vec<ChaosFault> {
    vec![
        ChaosFault::json(StatusCode::TOO_MANY_REQUESTS, "TooManyRequests", Some(3)),
        ChaosFault::json(StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError", None),
        ChaosFault::json(StatusCode::BAD_GATEWAY, "BadGateway", None),
        ChaosFault::json(StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", Some(3)),
        ChaosFault::json(StatusCode::GATEWAY_TIMEOUT, "GatewayTimeout", None),
    ]
}

/// Fault injection options.
#[derive(Clone)]
pub struct ChaosOptions {
    /// Percentage of requests answered with a random known fault (default: 10)
    pub chaos_percentage: u8,

    pub known_faults: Vec<ChaosFault>,

    /// When set, decides alone whether and how a request fails
    pub selector: Option<ChaosSelector>,
}

impl Default for ChaosOptions {
    fn default() -> Self {
        Self {
            chaos_percentage: 10,
            known_faults: default_chaos_faults(),
            selector: None,
        }
    }
}

impl fmt::Debug for ChaosOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosOptions")
            .field("chaos_percentage", &self.chaos_percentage)
            .field("known_faults", &self.known_faults)
            .field("selector", &self.selector.is_some())
            .finish()
    }
}

impl ChaosOptions {
    #[must_use]
    pub fn with_percentage(mut self, percentage: u8) -> Self {
        self.chaos_percentage = percentage.min(100);
        self
    }

    #[must_use]
    pub fn with_selector(
        mut self,
        selector: impl Fn(&NativeRequest) -> Option<ChaosFault> + Send + Sync + 'static,
    ) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }
}

/// Query parameter name decoding options.
#[derive(Debug, Clone)]
pub struct ParametersNameDecodingOptions {
    pub enabled: bool,
    /// Characters whose percent-encoded form is decoded in names (default: `$`)
    pub characters: BTreeSet<char>,
}

impl Default for ParametersNameDecodingOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            characters: BTreeSet::from(['$']),
        }
    }
}

impl ParametersNameDecodingOptions {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_characters(mut self, characters: impl IntoIterator<Item = char>) -> Self {
        self.characters = characters.into_iter().collect();
        self
    }
}

/// User-Agent enrichment options.
#[derive(Debug, Clone)]
pub struct UserAgentOptions {
    pub enabled: bool,
    pub product_name: String,
    pub product_version: String,
}

impl Default for UserAgentOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            product_name: DEFAULT_PRODUCT_NAME.to_owned(),
            product_version: DEFAULT_PRODUCT_VERSION.to_owned(),
        }
    }
}

impl UserAgentOptions {
    #[must_use]
    pub fn new(product_name: impl Into<String>, product_version: impl Into<String>) -> Self {
        Self {
            enabled: true,
            product_name: product_name.into(),
            product_version: product_version.into(),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// `name/version` token appended to the header
    #[must_use]
    pub fn product(&self) -> String {
        format!("{}/{}", self.product_name, self.product_version)
    }
}

/// Request enrichment options.
#[derive(Clone, Default)]
pub struct TelemetryOptions {
    pub enricher: Option<RequestEnricher>,
}

impl fmt::Debug for TelemetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryOptions")
            .field("enricher", &self.enricher.is_some())
            .finish()
    }
}

impl TelemetryOptions {
    #[must_use]
    pub fn new(enricher: impl Fn(&mut NativeRequest) + Send + Sync + 'static) -> Self {
        Self {
            enricher: Some(Arc::new(enricher)),
        }
    }
}

/// Header inspection options.
///
/// Attach a value to one request and keep a clone: clones write into the
/// same sinks, and each recording replaces what the previous attempt left.
/// Sinks are only written through the per-request option, never through a
/// handler default.
#[derive(Debug, Clone, Default)]
pub struct HeadersInspectionOptions {
    pub inspect_request_headers: bool,
    pub inspect_response_headers: bool,
    request_headers: Arc<Mutex<Headers>>,
    response_headers: Arc<Mutex<Headers>>,
}

impl HeadersInspectionOptions {
    #[must_use]
    pub fn new(inspect_request_headers: bool, inspect_response_headers: bool) -> Self {
        Self {
            inspect_request_headers,
            inspect_response_headers,
            ..Default::default()
        }
    }

    /// Snapshot of the captured outgoing headers
    #[must_use]
    pub fn request_headers(&self) -> Headers {
        self.request_headers.lock().clone()
    }

    /// Snapshot of the captured incoming headers
    #[must_use]
    pub fn response_headers(&self) -> Headers {
        self.response_headers.lock().clone()
    }

    pub(crate) fn record_request(&self, headers: &HeaderMap) {
        *self.request_headers.lock() = Headers::from(headers);
    }

    pub(crate) fn record_response(&self, headers: &HeaderMap) {
        *self.response_headers.lock() = Headers::from(headers);
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport security configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections (HTTPS only)
    #[default]
    TlsOnly,
    /// Allow plain HTTP connections (local mock servers only)
    AllowInsecureHttp,
}

/// Configuration of the default hyper transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-attempt timeout (default: 30 seconds)
    ///
    /// Each retry or redirect hop gets its own timeout.
    pub request_timeout: Duration,

    /// Transport security mode (default: `TlsOnly`)
    pub transport: TransportSecurity,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Idle connection lifetime in the pool (default: 90 seconds)
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum number of idle connections per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            transport: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Configuration for local mock servers (allows insecure HTTP)
    ///
    /// **WARNING**: Never use in production.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            transport: TransportSecurity::AllowInsecureHttp,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.tls_roots = roots;
        self
    }

    /// Allow plain HTTP connections
    ///
    /// Only available in debug builds or with the `allow-insecure-http` feature.
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    #[must_use]
    pub fn allow_insecure_http(mut self) -> Self {
        self.transport = TransportSecurity::AllowInsecureHttp;
        self
    }
}
