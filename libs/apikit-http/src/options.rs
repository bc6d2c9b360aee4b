//! Per-request handler options.
//!
//! Every handler option type has a fixed [`OptionKind`]. An [`OptionsBag`]
//! holds at most one value per kind: inserting a value of a kind that is
//! already present replaces it in place, so enumeration keeps the position of
//! the first insertion while lookups see the last writer.

use crate::config::{
    ChaosOptions, HeadersInspectionOptions, ParametersNameDecodingOptions, RedirectOptions,
    RetryOptions, TelemetryOptions, UserAgentOptions,
};

/// Identity of a handler option type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OptionKind {
    Redirect,
    Retry,
    Chaos,
    ParametersNameDecoding,
    UserAgent,
    Telemetry,
    HeadersInspection,
}

/// A handler option value tagged with its kind.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RequestOption {
    Redirect(RedirectOptions),
    Retry(RetryOptions),
    Chaos(ChaosOptions),
    ParametersNameDecoding(ParametersNameDecodingOptions),
    UserAgent(UserAgentOptions),
    Telemetry(TelemetryOptions),
    HeadersInspection(HeadersInspectionOptions),
}

impl RequestOption {
    #[must_use]
    pub fn kind(&self) -> OptionKind {
        match self {
            Self::Redirect(_) => OptionKind::Redirect,
            Self::Retry(_) => OptionKind::Retry,
            Self::Chaos(_) => OptionKind::Chaos,
            Self::ParametersNameDecoding(_) => OptionKind::ParametersNameDecoding,
            Self::UserAgent(_) => OptionKind::UserAgent,
            Self::Telemetry(_) => OptionKind::Telemetry,
            Self::HeadersInspection(_) => OptionKind::HeadersInspection,
        }
    }
}

/// Typed access to one [`RequestOption`] variant.
pub trait HandlerOption: Clone + Into<RequestOption> + Send + Sync + 'static {
    const KIND: OptionKind;

    fn from_option(option: &RequestOption) -> Option<&Self>;
}

macro_rules! handler_option {
    ($ty:ty, $variant:ident) => {
        impl HandlerOption for $ty {
            const KIND: OptionKind = OptionKind::$variant;

            fn from_option(option: &RequestOption) -> Option<&Self> {
                match option {
                    RequestOption::$variant(value) => Some(value),
                    _ => None,
                }
            }
        }

        impl From<$ty> for RequestOption {
            fn from(value: $ty) -> Self {
                RequestOption::$variant(value)
            }
        }
    };
}

handler_option!(RedirectOptions, Redirect);
handler_option!(RetryOptions, Retry);
handler_option!(ChaosOptions, Chaos);
handler_option!(ParametersNameDecodingOptions, ParametersNameDecoding);
handler_option!(UserAgentOptions, UserAgent);
handler_option!(TelemetryOptions, Telemetry);
handler_option!(HeadersInspectionOptions, HeadersInspection);

/// Per-request option bag.
#[derive(Debug, Clone, Default)]
pub struct OptionsBag {
    entries: Vec<RequestOption>,
}

impl OptionsBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an option, returning the value it replaced.
    pub fn insert(&mut self, option: impl Into<RequestOption>) -> Option<RequestOption> {
        let option = option.into();
        let kind = option.kind();
        match self.entries.iter_mut().find(|entry| entry.kind() == kind) {
            Some(slot) => Some(std::mem::replace(slot, option)),
            None => {
                self.entries.push(option);
                None
            }
        }
    }

    #[must_use]
    pub fn with(mut self, option: impl Into<RequestOption>) -> Self {
        self.insert(option);
        self
    }

    #[must_use]
    pub fn get<T: HandlerOption>(&self) -> Option<&T> {
        self.entries.iter().find_map(T::from_option)
    }

    pub fn remove(&mut self, kind: OptionKind) -> Option<RequestOption> {
        let index = self.entries.iter().position(|entry| entry.kind() == kind)?;
        Some(self.entries.remove(index))
    }

    #[must_use]
    pub fn contains(&self, kind: OptionKind) -> bool {
        self.entries.iter().any(|entry| entry.kind() == kind)
    }

    /// Options in first-insertion order
    pub fn iter(&self) -> impl Iterator<Item = &RequestOption> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into `self`; values from `other` win.
    pub fn extend(&mut self, other: &OptionsBag) {
        for option in other.iter() {
            self.insert(option.clone());
        }
    }
}

impl FromIterator<RequestOption> for OptionsBag {
    fn from_iter<I: IntoIterator<Item = RequestOption>>(iter: I) -> Self {
        let mut bag = Self::new();
        for option in iter {
            bag.insert(option);
        }
        bag
    }
}
