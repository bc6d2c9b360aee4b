use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;

use super::{Codec, FormCodec, JsonCodec, TextCodec};
use crate::error::HttpError;

/// Content-type → codec map.
///
/// Copy-on-write: registration swaps in a new map, so lookups never wait on
/// writers. Usually populated at startup and read-mostly afterwards.
pub struct CodecRegistry {
    codecs: ArcSwap<HashMap<String, Arc<dyn Codec>>>,
}

static GLOBAL: OnceLock<CodecRegistry> = OnceLock::new();

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("content_types", &self.content_types())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// Registry with no codecs
    #[must_use]
    pub fn new() -> Self {
        Self {
            codecs: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Registry with the JSON, text and form codecs
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(TextCodec));
        registry.register(Arc::new(FormCodec));
        registry
    }

    /// Process-wide registry, created with the default codecs on first use
    #[must_use]
    pub fn global() -> &'static CodecRegistry {
        GLOBAL.get_or_init(Self::with_defaults)
    }

    /// Register `codec` under its content type, replacing any previous one.
    pub fn register(&self, codec: Arc<dyn Codec>) {
        let key = normalize_content_type(codec.content_type());
        self.codecs.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), Arc::clone(&codec));
            next
        });
        tracing::debug!(content_type = %key, "Registered codec");
    }

    /// Find the codec for `content_type`.
    ///
    /// Matches exactly (case-insensitive, parameters ignored) first, then
    /// retries with the vendor-specific part removed.
    ///
    /// # Errors
    /// Returns `HttpError::UnsupportedContentType` when neither matches.
    pub fn get(&self, content_type: &str) -> Result<Arc<dyn Codec>, HttpError> {
        let normalized = normalize_content_type(content_type);
        let codecs = self.codecs.load();

        if let Some(codec) = codecs.get(&normalized) {
            return Ok(Arc::clone(codec));
        }
        if let Some(fallback) = vendor_fallback(&normalized)
            && let Some(codec) = codecs.get(&fallback)
        {
            tracing::trace!(content_type = %normalized, fallback = %fallback, "Using vendor fallback codec");
            return Ok(Arc::clone(codec));
        }

        Err(HttpError::UnsupportedContentType(content_type.to_owned()))
    }

    #[must_use]
    pub fn contains(&self, content_type: &str) -> bool {
        self.get(content_type).is_ok()
    }

    /// Registered content types, sorted
    #[must_use]
    pub fn content_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.codecs.load().keys().cloned().collect();
        types.sort();
        types
    }
}

/// Lowercase media type with parameters removed
#[must_use]
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Base media type of a vendor-specific one.
///
/// `application/vnd.foo+json` → `application/json`, `application/vnd.foo` →
/// `application/foo`. Returns `None` when there is nothing to strip.
#[must_use]
pub fn vendor_fallback(content_type: &str) -> Option<String> {
    let (kind, subtype) = content_type.split_once('/')?;
    if let Some((_, suffix)) = subtype.rsplit_once('+') {
        return (!suffix.is_empty()).then(|| format!("{kind}/{suffix}"));
    }
    let stripped = subtype.strip_prefix("vnd.")?;
    (!stripped.is_empty()).then(|| format!("{kind}/{stripped}"))
}
