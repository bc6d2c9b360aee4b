use bytes::Bytes;

use super::{Codec, ParseNode};
use crate::error::BoxError;

/// `application/json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn parse(&self, payload: &[u8]) -> Result<ParseNode, BoxError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn write(&self, node: &ParseNode) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(node)?))
    }
}
