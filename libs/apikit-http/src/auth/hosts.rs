use std::collections::BTreeSet;

use url::Url;

use crate::error::HttpError;

/// Host allow-list for token acquisition.
///
/// Hosts are compared case-insensitively and without port. An empty list
/// allows every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedHostsValidator {
    hosts: BTreeSet<String>,
}

fn validate_host(host: &str) -> Result<String, HttpError> {
    let host = host.trim();
    if host.contains("://") {
        return Err(HttpError::Configuration(format!(
            "allowed host '{host}' must not contain a scheme"
        )));
    }
    Ok(host.to_ascii_lowercase())
}

impl AllowedHostsValidator {
    /// # Errors
    /// Returns `HttpError::Configuration` for entries that include a scheme.
    pub fn new<I, S>(hosts: I) -> Result<Self, HttpError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|host| validate_host(host.as_ref()))
            .filter(|host| !matches!(host, Ok(h) if h.is_empty()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { hosts })
    }

    /// Replace the allow-list.
    ///
    /// # Errors
    /// Returns `HttpError::Configuration` for entries that include a scheme.
    pub fn set_allowed_hosts<I, S>(&mut self, hosts: I) -> Result<(), HttpError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        *self = Self::new(hosts)?;
        Ok(())
    }

    #[must_use]
    pub fn allowed_hosts(&self) -> Vec<String> {
        self.hosts.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_url_host_valid(&self, url: &Url) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        url.host_str()
            .is_some_and(|host| self.hosts.contains(&host.to_ascii_lowercase()))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_allows_everything() {
        let validator = AllowedHostsValidator::default();
        assert!(validator.is_url_host_valid(&Url::parse("https://anything.example").unwrap()));
    }

    #[test]
    fn test_host_match_ignores_case_and_port() {
        let validator = AllowedHostsValidator::new(["Graph.Example.com"]).unwrap();
        assert!(validator.is_url_host_valid(&Url::parse("https://graph.example.com:8443/v1").unwrap()));
        assert!(!validator.is_url_host_valid(&Url::parse("https://evil.example.com").unwrap()));
    }

    #[test]
    fn test_scheme_is_rejected() {
        let err = AllowedHostsValidator::new(["https://graph.example.com"]).unwrap_err();
        assert!(matches!(err, HttpError::Configuration(_)));
    }
}
