//! Redirect following.
//!
//! Follows 301, 302, 303, 307 and 308 responses by resending a copy of the
//! previous request through the rest of the chain:
//!
//! - 303, and 301/302 after an unsafe method, become a bodiless GET (HEAD stays HEAD)
//! - 307 and 308 keep the method and body
//! - a change of host or port strips `Authorization`, `Cookie` and
//!   `Proxy-Authorization`
//! - a change of scheme fails with `DisallowedSchemeChange` unless allowed
//!
//! The redirect bound is checked before `Location` is read, so a redirect
//! status past the bound always fails with `TooManyRedirects`.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, Uri, header};
use tracing::Instrument;
use url::Url;

use crate::body::{NativeRequest, NativeResponse, ReplayRequest, RequestBody, snapshot_for_replay};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::RedirectOptions;
use crate::error::{HttpError, InvalidUriKind};

/// Headers removed when a redirect leaves the original host
const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Headers describing a body, removed when a redirect drops the body
const BODY_HEADERS: &[header::HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::TRANSFER_ENCODING,
];

#[must_use]
pub fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Whether the redirected request becomes a bodiless GET
fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => !method.is_safe(),
        _ => false,
    }
}

fn is_cross_origin(from: &Url, to: &Url) -> bool {
    from.host_str() != to.host_str() || from.port_or_known_default() != to.port_or_known_default()
}

fn invalid_location(location: &str, reason: impl ToString) -> HttpError {
    HttpError::InvalidUri {
        url: location.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason: reason.to_string(),
    }
}

fn location(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Build the next hop from the previous request and the redirect response.
fn next_hop(
    previous: &ReplayRequest,
    status: StatusCode,
    location: &str,
    options: &RedirectOptions,
) -> Result<NativeRequest, HttpError> {
    let base = Url::parse(&previous.uri().to_string())
        .map_err(|err| invalid_location(&previous.uri().to_string(), err))?;
    let target = base.join(location).map_err(|err| invalid_location(location, err))?;

    if target.scheme() != base.scheme() && !options.allow_scheme_change {
        tracing::warn!(
            from = %base.scheme(),
            to = %target.scheme(),
            "Refusing redirect that changes the URL scheme"
        );
        return Err(HttpError::DisallowedSchemeChange {
            from: base.scheme().to_owned(),
            to: target.scheme().to_owned(),
        });
    }

    let mut request = previous.to_request();
    *request.uri_mut() = target
        .as_str()
        .parse::<Uri>()
        .map_err(|err| invalid_location(location, err))?;

    if downgrades_to_get(status, previous.method()) {
        *request.method_mut() = Method::GET;
        *request.body_mut() = RequestBody::Empty;
        for name in BODY_HEADERS {
            request.headers_mut().remove(name);
        }
    }

    if is_cross_origin(&base, &target) {
        for name in SENSITIVE_HEADERS {
            if request.headers_mut().remove(name).is_some() {
                tracing::debug!(header = %name, "Stripped sensitive header on cross-origin redirect");
            }
        }
    }

    Ok(request)
}

/// Follows redirect responses up to a bound.
#[derive(Debug, Clone, Default)]
pub struct RedirectHandler {
    options: RedirectOptions,
}

impl RedirectHandler {
    #[must_use]
    pub fn new(options: RedirectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    fn name(&self) -> &'static str {
        "redirect"
    }

    async fn handle(
        &self,
        request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let options = ctx.option_or(&self.options);
        let span = ctx.handler_span(self.name());

        async move {
            let (mut request, mut replay) =
                snapshot_for_replay(request, ctx.cancellation()).await?;
            let mut redirects = 0usize;

            loop {
                let response = next.run(request, ctx).await?;
                let status = response.status();
                if !is_redirect(status) || !options.allows(status, response.headers()) {
                    return Ok(response);
                }
                if redirects >= options.max_redirects {
                    return Err(HttpError::TooManyRedirects {
                        max: options.max_redirects,
                    });
                }
                let Some(location) = location(response.headers()) else {
                    tracing::debug!(status = %status, "Redirect without Location; returning response");
                    return Ok(response);
                };
                let Some(previous) = replay.take() else {
                    tracing::debug!(status = %status, "Request body is not replayable; not following redirect");
                    return Ok(response);
                };

                let hop = next_hop(&previous, status, location, options)?;
                redirects += 1;
                tracing::debug!(
                    status = %status,
                    redirect = redirects,
                    method = %hop.method(),
                    target = %crate::response::sanitize_uri(hop.uri()),
                    "Following redirect"
                );

                replay = ReplayRequest::of(&hop);
                request = hop;
            }
        }
        .instrument(span)
        .await
    }
}
