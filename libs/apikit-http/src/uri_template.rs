//! URI template expansion.
//!
//! [`DefaultUriTemplateExpander`] covers the subset of RFC 6570 that generated
//! request builders use: `{var}`, `{+var}`, `{#var}`, `{/var}`, `{?a,b}` and
//! `{&a}`, with the `*` explode modifier for lists. Undefined variables and
//! empty lists expand to nothing. Variable names are emitted exactly as they
//! appear in the template, so a name written as `%24select` stays encoded.

use std::collections::BTreeMap;

use crate::error::HttpError;
use crate::request::ParameterValue;

/// Expands a URI template against a set of parameter values.
pub trait UriTemplateExpander: Send + Sync {
    /// # Errors
    /// Returns `HttpError::UriTemplate` for malformed templates.
    fn expand(
        &self,
        template: &str,
        parameters: &BTreeMap<String, ParameterValue>,
    ) -> Result<String, HttpError>;
}

/// Built-in expander for the common RFC 6570 operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUriTemplateExpander;

#[derive(Clone, Copy)]
struct Operator {
    first: &'static str,
    separator: &'static str,
    named: bool,
    allow_reserved: bool,
}

impl Operator {
    fn parse(expression: &str) -> (Self, &str) {
        let simple = Self {
            first: "",
            separator: ",",
            named: false,
            allow_reserved: false,
        };
        match expression.chars().next() {
            Some('+') => (
                Self {
                    allow_reserved: true,
                    ..simple
                },
                &expression[1..],
            ),
            Some('#') => (
                Self {
                    first: "#",
                    allow_reserved: true,
                    ..simple
                },
                &expression[1..],
            ),
            Some('/') => (
                Self {
                    first: "/",
                    separator: "/",
                    ..simple
                },
                &expression[1..],
            ),
            Some('?') => (
                Self {
                    first: "?",
                    separator: "&",
                    named: true,
                    ..simple
                },
                &expression[1..],
            ),
            Some('&') => (
                Self {
                    first: "&",
                    separator: "&",
                    named: true,
                    ..simple
                },
                &expression[1..],
            ),
            _ => (simple, expression),
        }
    }

    fn encode(self, value: &str) -> String {
        if self.allow_reserved {
            encode_reserved(value)
        } else {
            urlencoding::encode(value).into_owned()
        }
    }
}

const RESERVED: &str = ":/?#[]@!$&'()*+,;=";
const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Percent-encode everything except unreserved and reserved characters.
/// Existing `%XX` triplets pass through.
fn encode_reserved(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        let is_triplet = byte == b'%'
            && bytes.get(index + 1).is_some_and(u8::is_ascii_hexdigit)
            && bytes.get(index + 2).is_some_and(u8::is_ascii_hexdigit);
        if byte.is_ascii_alphanumeric()
            || b"-._~".contains(&byte)
            || RESERVED.as_bytes().contains(&byte)
            || is_triplet
        {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0F)]));
        }
        index += 1;
    }
    out
}

fn is_valid_varname(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '%'))
}

fn expand_expression(
    template: &str,
    expression: &str,
    parameters: &BTreeMap<String, ParameterValue>,
    out: &mut String,
) -> Result<(), HttpError> {
    let (operator, variables) = Operator::parse(expression);
    let mut first = true;

    for varspec in variables.split(',') {
        let (name, explode) = match varspec.strip_suffix('*') {
            Some(name) => (name, true),
            None => (varspec, false),
        };
        if !is_valid_varname(name) {
            return Err(HttpError::UriTemplate {
                template: template.to_owned(),
                reason: format!("invalid variable name '{varspec}'"),
            });
        }

        let Some(value) = parameters.get(name) else {
            continue;
        };
        let items = value.to_strings();
        if items.is_empty() {
            continue;
        }

        out.push_str(if first {
            operator.first
        } else {
            operator.separator
        });
        first = false;

        if explode && items.len() > 1 {
            let parts: Vec<String> = items
                .iter()
                .map(|item| {
                    let encoded = operator.encode(item);
                    if operator.named {
                        format!("{name}={encoded}")
                    } else {
                        encoded
                    }
                })
                .collect();
            out.push_str(&parts.join(operator.separator));
        } else {
            let encoded: Vec<String> = items.iter().map(|item| operator.encode(item)).collect();
            if operator.named {
                out.push_str(name);
                out.push('=');
            }
            out.push_str(&encoded.join(","));
        }
    }
    Ok(())
}

impl UriTemplateExpander for DefaultUriTemplateExpander {
    fn expand(
        &self,
        template: &str,
        parameters: &BTreeMap<String, ParameterValue>,
    ) -> Result<String, HttpError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                return Err(HttpError::UriTemplate {
                    template: template.to_owned(),
                    reason: "unclosed expression".to_owned(),
                });
            };
            expand_expression(template, &after[..close], parameters, &mut out)?;
            rest = &after[close + 1..];
        }

        if rest.contains('}') {
            return Err(HttpError::UriTemplate {
                template: template.to_owned(),
                reason: "unmatched '}'".to_owned(),
            });
        }
        out.push_str(rest);
        Ok(out)
    }
}
