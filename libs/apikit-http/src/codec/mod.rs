//! Content-type codecs.
//!
//! A codec converts between payload bytes and a [`ParseNode`], the generic
//! document tree that models are (de)serialized from with serde. The
//! [`CodecRegistry`] selects a codec by content type.

mod form;
mod json;
mod registry;
mod text;

use bytes::Bytes;

use crate::error::BoxError;

pub use form::FormCodec;
pub use json::JsonCodec;
pub use registry::{CodecRegistry, normalize_content_type, vendor_fallback};
pub use text::TextCodec;

/// Generic document tree produced and consumed by codecs
pub type ParseNode = serde_json::Value;

/// Reads and writes payloads of one content type.
pub trait Codec: Send + Sync {
    /// Lowercase media type without parameters, e.g. `application/json`
    fn content_type(&self) -> &'static str;

    /// Parse a payload into a node.
    ///
    /// # Errors
    /// Returns the codec's own error for malformed payloads.
    fn parse(&self, payload: &[u8]) -> Result<ParseNode, BoxError>;

    /// Serialize a node into a payload.
    ///
    /// # Errors
    /// Returns the codec's own error for nodes it cannot represent.
    fn write(&self, node: &ParseNode) -> Result<Bytes, BoxError>;
}
