//! `WWW-Authenticate` claims challenge parsing.

use http::HeaderMap;
use http::header::WWW_AUTHENTICATE;

/// Split a challenge's auth-params on commas outside quoted strings.
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (index, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&params[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

/// Value of the `claims` parameter of a `Bearer` challenge, if any.
///
/// The value is returned as sent (typically base64-encoded JSON) and is
/// handed unchanged to the token provider.
#[must_use]
pub fn claims_from_challenge(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|challenge| {
            let challenge = challenge.trim();
            let (scheme, params) = challenge.split_once(' ').unwrap_or((challenge, ""));
            if !scheme.eq_ignore_ascii_case("bearer") {
                return None;
            }
            split_params(params).into_iter().find_map(|param| {
                let (key, value) = param.split_once('=')?;
                if !key.trim().eq_ignore_ascii_case("claims") {
                    return None;
                }
                let value = value.trim().trim_matches('"');
                (!value.is_empty()).then(|| value.to_owned())
            })
        })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_claims_extracted() {
        let h = headers(
            r#"Bearer realm="", authorization_uri="https://login.example.com/authorize", error="insufficient_claims", claims="eyJhY2Nlc3NfdG9rZW4iOnt9fQ==""#,
        );
        assert_eq!(
            claims_from_challenge(&h).as_deref(),
            Some("eyJhY2Nlc3NfdG9rZW4iOnt9fQ==")
        );
    }

    #[test]
    fn test_no_claims_or_other_scheme() {
        assert_eq!(claims_from_challenge(&headers(r#"Bearer realm="api""#)), None);
        assert_eq!(claims_from_challenge(&headers(r#"Basic claims="abc""#)), None);
        assert_eq!(claims_from_challenge(&headers(r#"Bearer claims="""#)), None);
        assert_eq!(claims_from_challenge(&HeaderMap::new()), None);
    }

    #[test]
    fn test_comma_inside_quotes() {
        let h = headers(r#"Bearer error_description="a, b", claims="xyz""#);
        assert_eq!(claims_from_challenge(&h).as_deref(), Some("xyz"));
    }
}
