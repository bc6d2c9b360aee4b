//! Transport-agnostic description of one API call.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::body::RequestBody;
use crate::codec::{CodecRegistry, ParseNode};
use crate::error::{BoxError, HttpError, InvalidUriKind};
use crate::headers::Headers;
use crate::options::{OptionKind, OptionsBag, RequestOption};
use crate::response::NativeCapture;
use crate::uri_template::{DefaultUriTemplateExpander, UriTemplateExpander};

/// Path parameter holding the adapter's base URL
pub const BASE_URL_PARAMETER: &str = "baseurl";

/// Value substituted into a URI template.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<String>),
}

impl ParameterValue {
    /// Textual form of each item; scalars yield one item
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Self::String(value) => vec![value.clone()],
            Self::Integer(value) => vec![value.to_string()],
            Self::Float(value) => vec![value.to_string()],
            Self::Boolean(value) => vec![value.to_string()],
            Self::List(values) => values.clone(),
        }
    }

    fn from_node(node: &ParseNode) -> Option<Self> {
        match node {
            ParseNode::Null | ParseNode::Object(_) => None,
            ParseNode::String(value) => Some(Self::String(value.clone())),
            ParseNode::Bool(value) => Some(Self::Boolean(*value)),
            ParseNode::Number(number) => number
                .as_i64()
                .map(Self::Integer)
                .or_else(|| number.as_f64().map(Self::Float)),
            ParseNode::Array(items) => Some(Self::List(
                items
                    .iter()
                    .filter_map(Self::from_node)
                    .flat_map(|item| item.to_strings())
                    .collect(),
            )),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

impl From<url::Url> for ParameterValue {
    fn from(value: url::Url) -> Self {
        Self::String(value.into())
    }
}

/// Abstract request: method, URI template and parameters, headers, body,
/// per-request options and an optional raw-response capture.
///
/// Created per logical call and consumed by the adapter.
#[derive(Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url_template: String,
    pub path_parameters: BTreeMap<String, ParameterValue>,
    pub query_parameters: BTreeMap<String, ParameterValue>,
    pub headers: Headers,
    url: Option<Url>,
    body: RequestBody,
    options: OptionsBag,
    capture: Option<NativeCapture>,
    cancellation: CancellationToken,
}

impl RequestDescriptor {
    #[must_use]
    pub fn new(method: Method, url_template: impl Into<String>) -> Self {
        Self {
            method,
            url_template: url_template.into(),
            path_parameters: BTreeMap::new(),
            query_parameters: BTreeMap::new(),
            headers: Headers::new(),
            url: None,
            body: RequestBody::Empty,
            options: OptionsBag::new(),
            capture: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Descriptor targeting a fixed URL instead of a template
    #[must_use]
    pub fn from_url(method: Method, url: Url) -> Self {
        let mut descriptor = Self::new(method, String::new());
        descriptor.url = Some(url);
        descriptor
    }

    /// Override the URL; template and parameters are ignored afterwards
    pub fn set_url(&mut self, url: Url) {
        self.url = Some(url);
    }

    #[must_use]
    pub fn url_override(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Resolve the target URL with the built-in template expander.
    ///
    /// # Errors
    /// See [`RequestDescriptor::uri_with`].
    pub fn uri(&self) -> Result<Url, HttpError> {
        self.uri_with(&DefaultUriTemplateExpander)
    }

    /// Resolve the target URL.
    ///
    /// Returns the override when set; otherwise expands the template with
    /// the path parameters merged with the query parameters.
    ///
    /// # Errors
    /// Returns `HttpError::UriTemplate` for malformed templates and
    /// `HttpError::InvalidUri` when the expansion is not an absolute URL.
    pub fn uri_with(&self, expander: &dyn UriTemplateExpander) -> Result<Url, HttpError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let mut parameters = self.path_parameters.clone();
        parameters.extend(
            self.query_parameters
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        let expanded = expander.expand(&self.url_template, &parameters)?;

        Url::parse(&expanded).map_err(|err| {
            let kind = match err {
                url::ParseError::RelativeUrlWithoutBase => InvalidUriKind::MissingScheme,
                url::ParseError::EmptyHost => InvalidUriKind::MissingAuthority,
                _ => InvalidUriKind::ParseError,
            };
            HttpError::InvalidUri {
                url: expanded.clone(),
                kind,
                reason: err.to_string(),
            }
        })
    }

    pub fn add_path_parameter(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.path_parameters.insert(name.into(), value.into());
    }

    pub fn add_query_parameter(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.query_parameters.insert(name.into(), value.into());
    }

    /// Add every field of a serializable query-parameter struct.
    ///
    /// Field names are used as serialized (after serde renames); `None`
    /// fields are skipped.
    ///
    /// # Errors
    /// Returns `HttpError::Json` if `parameters` does not serialize to an object.
    pub fn add_query_parameters<T: Serialize>(&mut self, parameters: &T) -> Result<(), HttpError> {
        let node = serde_json::to_value(parameters)?;
        let ParseNode::Object(fields) = node else {
            return Err(HttpError::Json(serde::ser::Error::custom(
                "query parameters must serialize to an object",
            )));
        };
        for (name, value) in &fields {
            if let Some(value) = ParameterValue::from_node(value) {
                self.query_parameters.insert(name.clone(), value);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn set_body(&mut self, body: RequestBody) {
        self.body = body;
    }

    pub(crate) fn take_body(&mut self) -> RequestBody {
        std::mem::take(&mut self.body)
    }

    /// Set a buffered body and its content type.
    ///
    /// # Errors
    /// Returns an error if `content_type` is not a valid header value.
    pub fn set_content(&mut self, content: Bytes, content_type: &str) -> Result<(), HttpError> {
        self.headers.add(http::header::CONTENT_TYPE.as_str(), content_type)?;
        self.body = RequestBody::Buffered(content);
        Ok(())
    }

    /// Serialize `model` with the codec registered for `content_type`.
    ///
    /// # Errors
    /// Returns `HttpError::UnsupportedContentType` when no codec matches,
    /// `HttpError::Json` when the model cannot be converted to a parse node,
    /// and `HttpError::Codec` when the codec rejects it.
    pub fn set_content_from_model<T: Serialize>(
        &mut self,
        codecs: &CodecRegistry,
        content_type: &str,
        model: &T,
    ) -> Result<(), HttpError> {
        let codec = codecs.get(content_type)?;
        let node = serde_json::to_value(model)?;
        let payload = codec.write(&node).map_err(|source: BoxError| HttpError::Codec {
            content_type: content_type.to_owned(),
            source,
        })?;
        self.set_content(payload, content_type)
    }

    /// Set a streamed body sent as `application/octet-stream`.
    ///
    /// Streams without a known length cannot be replayed by retry, redirect
    /// or re-authentication.
    pub fn set_stream_content<B>(&mut self, body: B, length: Option<u64>)
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.headers.add_parsed(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/octet-stream"),
        );
        self.body = RequestBody::stream(body, length);
    }

    #[must_use]
    pub fn options(&self) -> &OptionsBag {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut OptionsBag {
        &mut self.options
    }

    pub fn add_option(&mut self, option: impl Into<RequestOption>) {
        self.options.insert(option);
    }

    pub fn remove_option(&mut self, kind: OptionKind) -> Option<RequestOption> {
        self.options.remove(kind)
    }

    /// Receive the raw response instead of a deserialized model
    pub fn set_native_capture(&mut self, capture: NativeCapture) {
        self.capture = Some(capture);
    }

    #[must_use]
    pub fn native_capture(&self) -> Option<&NativeCapture> {
        self.capture.as_ref()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Tie the call to an external cancellation scope
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Buffer a known-length stream body so that [`Self::try_clone`] succeeds.
    ///
    /// Streams of unknown length stay as they are.
    pub(crate) async fn make_replayable(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<(), HttpError> {
        let body = self.take_body();
        self.body = body.into_replayable(cancellation).await?;
        Ok(())
    }

    /// Deep copy for a resend.
    ///
    /// Headers, parameters and options are copied; the capture slot and the
    /// cancellation scope are shared with the original. Returns `None` when
    /// the body is a stream.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            url_template: self.url_template.clone(),
            path_parameters: self.path_parameters.clone(),
            query_parameters: self.query_parameters.clone(),
            headers: self.headers.clone(),
            url: self.url.clone(),
            body: self.body.try_clone()?,
            options: self.options.clone(),
            capture: self.capture.clone(),
            cancellation: self.cancellation.clone(),
        })
    }
}
