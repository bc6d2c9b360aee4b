//! Case-insensitive, multi-value request and response headers.
//!
//! Names are normalized by [`http::HeaderName`], so lookups, inserts and
//! removals ignore case. Values for a name form an ordered set: adding a value
//! that is already present is a no-op. A closed set of singleton names always
//! holds exactly one value and adding replaces it.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::error::HttpError;

/// Header names that hold exactly one value.
pub const SINGLETON_HEADERS: &[HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
];

/// Multi-value header map with singleton and de-duplication rules.
///
/// `Clone` is a deep copy; retries and redirects never share mutable state
/// with the request they were cloned from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: HeaderMap,
}

fn is_singleton(name: &HeaderName) -> bool {
    SINGLETON_HEADERS.contains(name)
}

fn parse_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), HttpError> {
    let name = HeaderName::try_from(name)?;
    let value = HeaderValue::try_from(value)?;
    Ok((name, value))
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value under `name`.
    ///
    /// Returns `Ok(true)` when the map changed. Singleton names replace their
    /// previous value; other names keep existing values and skip duplicates.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderName` / `InvalidHeaderValue` for
    /// values that cannot go on the wire.
    pub fn add(&mut self, name: &str, value: &str) -> Result<bool, HttpError> {
        let (name, value) = parse_pair(name, value)?;
        Ok(self.add_parsed(name, value))
    }

    /// Add several values under `name`. An empty slice is a no-op.
    ///
    /// For singleton names only the last value is kept.
    ///
    /// # Errors
    /// Returns an error if the name or any value is invalid; the map is left
    /// unchanged in that case.
    pub fn add_all(&mut self, name: &str, values: &[&str]) -> Result<bool, HttpError> {
        if values.is_empty() {
            return Ok(false);
        }
        let name = HeaderName::try_from(name)?;
        let parsed = values
            .iter()
            .map(|v| HeaderValue::try_from(*v))
            .collect::<Result<Vec<_>, _>>()?;

        let mut changed = false;
        for value in parsed {
            changed |= self.add_parsed(name.clone(), value);
        }
        Ok(changed)
    }

    /// Add `value` only if `name` has no value yet.
    ///
    /// # Errors
    /// Returns an error if the name or value is invalid.
    pub fn try_add(&mut self, name: &str, value: &str) -> Result<bool, HttpError> {
        let (name, value) = parse_pair(name, value)?;
        if self.inner.contains_key(&name) {
            return Ok(false);
        }
        self.inner.insert(name, value);
        Ok(true)
    }

    /// Replace `name` with a single value that is marked sensitive, so that
    /// it is never logged or compressed by HPACK.
    ///
    /// # Errors
    /// Returns an error if the name or value is invalid.
    pub fn insert_sensitive(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        let (name, mut value) = parse_pair(name, value)?;
        value.set_sensitive(true);
        self.inner.insert(name, value);
        Ok(())
    }

    pub(crate) fn add_parsed(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if is_singleton(&name) {
            let previous = self.inner.insert(name, value.clone());
            return previous.as_ref() != Some(&value);
        }
        if self.inner.get_all(&name).iter().any(|v| *v == value) {
            return false;
        }
        self.inner.append(name, value);
        true
    }

    /// Values stored under `name`, in insertion order. Non-UTF-8 values are skipped.
    #[must_use]
    pub fn get(&self, name: &str) -> Vec<&str> {
        let Ok(name) = HeaderName::try_from(name) else {
            return Vec::new();
        };
        self.inner
            .get_all(&name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// First value stored under `name`.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.inner.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Remove every value stored under `name`.
    pub fn remove(&mut self, name: &str) -> bool {
        let Ok(name) = HeaderName::try_from(name) else {
            return false;
        };
        self.inner.remove(&name).is_some()
    }

    /// Remove one value from `name`, dropping the name when no value is left.
    pub fn remove_value(&mut self, name: &str, value: &str) -> bool {
        let Ok(name) = HeaderName::try_from(name) else {
            return false;
        };
        let values: Vec<HeaderValue> = self.inner.get_all(&name).iter().cloned().collect();
        if !values.iter().any(|v| v == value) {
            return false;
        }
        self.inner.remove(&name);
        for kept in values.into_iter().filter(|v| v != value) {
            self.inner.append(name.clone(), kept);
        }
        true
    }

    /// Merge every value of `other` into `self`, applying the same rules as [`Headers::add`].
    pub fn extend(&mut self, other: &Headers) {
        for (name, value) in &other.inner {
            self.add_parsed(name.clone(), value.clone());
        }
    }

    /// Iterate over names and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.inner.keys().map(|name| {
            let values = self
                .inner
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            (name.as_str(), values)
        })
    }

    /// Number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.keys_len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    #[must_use]
    pub fn as_header_map(&self) -> &HeaderMap {
        &self.inner
    }

    #[must_use]
    pub fn into_header_map(self) -> HeaderMap {
        self.inner
    }
}

impl From<HeaderMap> for Headers {
    fn from(map: HeaderMap) -> Self {
        let mut headers = Headers::new();
        // `None` repeats the previous name
        let mut current: Option<HeaderName> = None;
        for (name, value) in map {
            if name.is_some() {
                current = name;
            }
            if let Some(name) = &current {
                headers.add_parsed(name.clone(), value);
            }
        }
        headers
    }
}

impl From<&HeaderMap> for Headers {
    fn from(map: &HeaderMap) -> Self {
        let mut headers = Headers::new();
        for (name, value) in map {
            headers.add_parsed(name.clone(), value.clone());
        }
        headers
    }
}
