//! Mapping code extraction and target URL composition

use crate::domain::{Mapping, MappingCode};
use crate::proxy::headers::paths::RESERVED_SEGMENTS;
use crate::proxy::types::*;
use hyper::Uri;

/// Inbound path split into the mapping code and what follows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPath {
    pub code: MappingCode,
    /// Path after the code segment, without its leading slash
    pub remainder: String,
    pub query: Option<String>,
}

impl RoutedPath {
    /// Whether the first remainder segment equals `marker`
    pub fn is_mock(&self, marker: &str) -> bool {
        !marker.is_empty() && self.remainder.split('/').next() == Some(marker)
    }
}

/// Resolves inbound paths against registered mappings
pub struct UrlResolver;

impl UrlResolver {
    /// Extract the mapping code from the leading path segment
    ///
    /// A segment that cannot be a code is reported as not found, the same
    /// as an unknown code.
    pub fn route(uri: &Uri) -> ProxyResult<RoutedPath> {
        let path = uri.path().trim_start_matches('/');
        let (segment, remainder) = path.split_once('/').unwrap_or((path, ""));

        if RESERVED_SEGMENTS.contains(&segment) {
            return Err(ProxyError::not_found(segment));
        }

        let code = MappingCode::try_new(segment.to_string())
            .map_err(|_| ProxyError::not_found(segment))?;

        Ok(RoutedPath {
            code,
            remainder: remainder.to_string(),
            query: uri.query().map(str::to_string),
        })
    }

    /// Destination base URL of a mapping, checked to be absolute http(s)
    pub fn validate_destination(mapping: &Mapping) -> ProxyResult<Uri> {
        let invalid = |reason: &str| ProxyError::InvalidConfiguration {
            code: mapping.code.clone(),
            reason: reason.to_string(),
        };

        let uri: Uri = mapping
            .destination_base_url
            .trim()
            .parse()
            .map_err(|_| invalid("destination is not a valid URL"))?;

        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            Some(_) => return Err(invalid("destination scheme must be http or https")),
            None => return Err(invalid("destination must be an absolute URL")),
        }

        if uri.authority().is_none_or(|a| a.host().is_empty()) {
            return Err(invalid("destination has no host"));
        }

        Ok(uri)
    }

    /// Join the remainder onto the base path with exactly one slash at the
    /// seam; the inbound query is appended untouched
    pub fn join_target(base: &Uri, remainder: &str, query: Option<&str>) -> ProxyResult<Uri> {
        let base_path = base.path();
        let remainder = remainder.trim_start_matches('/');

        let mut target = String::with_capacity(base_path.len() + remainder.len() + 64);
        if let Some(scheme) = base.scheme_str() {
            target.push_str(scheme);
            target.push_str("://");
        }
        if let Some(authority) = base.authority() {
            target.push_str(authority.as_str());
        }

        if remainder.is_empty() {
            target.push_str(if base_path.is_empty() { "/" } else { base_path });
        } else {
            target.push_str(base_path.trim_end_matches('/'));
            target.push('/');
            target.push_str(remainder);
        }

        let query = match (base.query(), query) {
            (Some(base_query), Some(query)) if !query.is_empty() => {
                Some(format!("{base_query}&{query}"))
            }
            (Some(base_query), _) => Some(base_query.to_string()),
            (None, Some(query)) => Some(query.to_string()),
            (None, None) => None,
        };
        if let Some(query) = query {
            target.push('?');
            target.push_str(&query);
        }

        target
            .parse()
            .map_err(|_| ProxyError::Internal(format!("rewritten target '{target}' is not a valid URI")))
    }

    /// Full rewrite of an inbound request onto a mapping
    pub fn resolve(mapping: &Mapping, routed: &RoutedPath) -> ProxyResult<Uri> {
        let base = Self::validate_destination(mapping)?;
        Self::join_target(&base, &routed.remainder, routed.query.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn mapping(destination: &str) -> Mapping {
        Mapping::new(MappingCode::try_new("ab12cd").unwrap(), destination)
    }

    #[test]
    fn route_extracts_code_remainder_and_query() {
        let uri: Uri = "/ab12cd/users/1?x=1&y=%20".parse().unwrap();
        let routed = UrlResolver::route(&uri).unwrap();

        assert_eq!(routed.code.as_ref(), "ab12cd");
        assert_eq!(routed.remainder, "users/1");
        assert_eq!(routed.query.as_deref(), Some("x=1&y=%20"));
    }

    #[test]
    fn route_without_remainder() {
        let routed = UrlResolver::route(&"/ab12cd".parse().unwrap()).unwrap();
        assert_eq!(routed.remainder, "");
        assert_eq!(routed.query, None);
    }

    #[rstest]
    #[case("/")]
    #[case("/bad%20code/x")]
    #[case("/events/extra")]
    #[case("/logs")]
    fn route_rejects_non_codes_as_not_found(#[case] path: &str) {
        let result = UrlResolver::route(&path.parse().unwrap());
        assert!(matches!(result, Err(ProxyError::NotFound { .. })));
    }

    #[test]
    fn mock_marker_must_be_first_remainder_segment() {
        let routed = UrlResolver::route(&"/ab12cd/__mock__/x".parse().unwrap()).unwrap();
        assert!(routed.is_mock("__mock__"));

        let routed = UrlResolver::route(&"/ab12cd/x/__mock__".parse().unwrap()).unwrap();
        assert!(!routed.is_mock("__mock__"));
    }

    #[rstest]
    #[case("https://api.example.com", "users/1", None, "https://api.example.com/users/1")]
    #[case("https://api.example.com/", "users/1", None, "https://api.example.com/users/1")]
    #[case("https://api.example.com/v1", "users", None, "https://api.example.com/v1/users")]
    #[case("https://api.example.com/v1/", "/users", None, "https://api.example.com/v1/users")]
    #[case("http://localhost:9000/v1", "", None, "http://localhost:9000/v1")]
    #[case("http://localhost:9000", "", None, "http://localhost:9000/")]
    #[case("http://h.test/v1", "a", Some("x=1&y=%20"), "http://h.test/v1/a?x=1&y=%20")]
    #[case("http://h.test/v1?k=v", "a", Some("x=1"), "http://h.test/v1/a?k=v&x=1")]
    fn join_target_uses_one_slash_at_seam(
        #[case] base: &str,
        #[case] remainder: &str,
        #[case] query: Option<&str>,
        #[case] expected: &str,
    ) {
        let base: Uri = base.parse().unwrap();
        let target = UrlResolver::join_target(&base, remainder, query).unwrap();
        assert_eq!(target.to_string(), expected);
    }

    #[rstest]
    #[case("not a url")]
    #[case("ftp://files.example.com")]
    #[case("/relative/path")]
    fn invalid_destinations_are_rejected(#[case] destination: &str) {
        let result = UrlResolver::validate_destination(&mapping(destination));
        assert!(matches!(
            result,
            Err(ProxyError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn resolve_rewrites_onto_destination() {
        let routed = UrlResolver::route(&"/ab12cd/users/1?active=true".parse().unwrap()).unwrap();
        let target = UrlResolver::resolve(&mapping("https://api.example.com/v2"), &routed).unwrap();

        assert_eq!(
            target.to_string(),
            "https://api.example.com/v2/users/1?active=true"
        );
    }
}
