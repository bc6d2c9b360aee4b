//! Query parameter name normalization.
//!
//! Some services reject names such as `%24select` and only accept the literal
//! `$select`. This handler decodes `%XX` sequences for a configured set of
//! characters in the names of query parameters. Values and the path are never
//! touched.

use std::borrow::Cow;
use std::collections::BTreeSet;

use async_trait::async_trait;
use http::Uri;
use http::uri::PathAndQuery;
use tracing::Instrument;

use crate::body::{NativeRequest, NativeResponse};
use crate::chain::{Handler, Next, RequestContext};
use crate::config::ParametersNameDecodingOptions;
use crate::error::HttpError;

/// Decode the `%XX` sequences in `name` whose character is in `characters`.
#[must_use]
pub fn decode_parameter_name<'a>(name: &'a str, characters: &BTreeSet<char>) -> Cow<'a, str> {
    if !name.contains('%') {
        return Cow::Borrowed(name);
    }

    let mut decoded = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        decoded.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let hit = tail
            .get(1..3)
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .map(char::from)
            .filter(|c| c.is_ascii() && characters.contains(c));
        if let Some(c) = hit {
            decoded.push(c);
            rest = &tail[3..];
        } else {
            decoded.push('%');
            rest = &tail[1..];
        }
    }
    decoded.push_str(rest);
    Cow::Owned(decoded)
}

/// Decoded query string, or `None` when nothing changed
fn decode_query(query: &str, characters: &BTreeSet<char>) -> Option<String> {
    let decoded = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => format!("{}={value}", decode_parameter_name(name, characters)),
            None => decode_parameter_name(pair, characters).into_owned(),
        })
        .collect::<Vec<_>>()
        .join("&");
    (decoded != query).then_some(decoded)
}

fn rewrite_uri(uri: &Uri, query: &str) -> Option<Uri> {
    let mut parts = uri.clone().into_parts();
    let path_and_query = {
        let path = parts.path_and_query.as_ref().map_or("/", PathAndQuery::path);
        PathAndQuery::try_from(format!("{path}?{query}")).ok()?
    };
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).ok()
}

#[derive(Debug, Clone, Default)]
pub struct ParametersNameDecodingHandler {
    options: ParametersNameDecodingOptions,
}

impl ParametersNameDecodingHandler {
    #[must_use]
    pub fn new(options: ParametersNameDecodingOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Handler for ParametersNameDecodingHandler {
    fn name(&self) -> &'static str {
        "parameters_name_decoding"
    }

    async fn handle(
        &self,
        mut request: NativeRequest,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<NativeResponse, HttpError> {
        let options = ctx.option_or(&self.options);
        if !options.enabled || options.characters.is_empty() {
            return next.run(request, ctx).await;
        }

        let span = ctx.handler_span(self.name());
        async move {
            let decoded = request
                .uri()
                .query()
                .filter(|query| query.contains('%'))
                .and_then(|query| decode_query(query, &options.characters));
            if let Some(query) = decoded {
                match rewrite_uri(request.uri(), &query) {
                    Some(uri) => *request.uri_mut() = uri,
                    None => tracing::debug!("Decoded query is not a valid URI; sending as is"),
                }
            }
            next.run(request, ctx).await
        }
        .instrument(span)
        .await
    }
}
