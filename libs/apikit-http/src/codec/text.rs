use bytes::Bytes;

use super::{Codec, ParseNode};
use crate::error::BoxError;

/// `text/plain`; reads payloads as a string node and writes scalars only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn parse(&self, payload: &[u8]) -> Result<ParseNode, BoxError> {
        let text = std::str::from_utf8(payload)?;
        Ok(ParseNode::String(text.to_owned()))
    }

    fn write(&self, node: &ParseNode) -> Result<Bytes, BoxError> {
        match node {
            ParseNode::String(text) => Ok(Bytes::from(text.clone())),
            ParseNode::Number(number) => Ok(Bytes::from(number.to_string())),
            ParseNode::Bool(flag) => Ok(Bytes::from(flag.to_string())),
            ParseNode::Null => Ok(Bytes::new()),
            ParseNode::Array(_) | ParseNode::Object(_) => {
                Err("text/plain can only carry scalar values".into())
            }
        }
    }
}
