use bytes::Bytes;
use serde_json::Map;

use super::{Codec, ParseNode};
use crate::error::BoxError;

/// `application/x-www-form-urlencoded`
///
/// Objects map to key/value pairs; arrays repeat their key. Nested objects
/// cannot be represented.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormCodec;

fn scalar(value: &ParseNode) -> Result<Option<String>, BoxError> {
    match value {
        ParseNode::Null => Ok(None),
        ParseNode::String(text) => Ok(Some(text.clone())),
        ParseNode::Number(number) => Ok(Some(number.to_string())),
        ParseNode::Bool(flag) => Ok(Some(flag.to_string())),
        ParseNode::Array(_) | ParseNode::Object(_) => {
            Err("form values must be scalars or arrays of scalars".into())
        }
    }
}

impl Codec for FormCodec {
    fn content_type(&self) -> &'static str {
        "application/x-www-form-urlencoded"
    }

    fn parse(&self, payload: &[u8]) -> Result<ParseNode, BoxError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(payload)?;
        let mut object = Map::new();
        for (key, value) in pairs {
            match object.get_mut(&key) {
                Some(ParseNode::Array(values)) => values.push(ParseNode::String(value)),
                Some(existing) => {
                    let first = existing.take();
                    *existing = ParseNode::Array(vec![first, ParseNode::String(value)]);
                }
                None => {
                    object.insert(key, ParseNode::String(value));
                }
            }
        }
        Ok(ParseNode::Object(object))
    }

    fn write(&self, node: &ParseNode) -> Result<Bytes, BoxError> {
        let ParseNode::Object(object) = node else {
            return Err("form payloads must be objects".into());
        };

        let mut pairs = Vec::with_capacity(object.len());
        for (key, value) in object {
            if let ParseNode::Array(values) = value {
                for item in values {
                    if let Some(text) = scalar(item)? {
                        pairs.push((key.as_str(), text));
                    }
                }
            } else if let Some(text) = scalar(value)? {
                pairs.push((key.as_str(), text));
            }
        }
        Ok(Bytes::from(serde_urlencoded::to_string(pairs)?))
    }
}
