//! Header policy for the relay
//!
//! Decides which inbound headers travel upstream, which are stripped at the
//! trust boundary, and which are removed before an exchange is recorded.
//! Two forwarding policies exist because deployments disagree on how much of
//! the caller's header set should reach the destination:
//!
//! - `Denylist`: forward everything except identity and hop-by-hop headers
//! - `Allowlist`: forward only the configured names
//!
//! In both cases `host` is rewritten to the destination authority.

use crate::domain::RedactedHeaders;
use crate::proxy::types::DeploymentMode;
use ::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use tracing::warn;

/// Control endpoints served by the relay itself
pub mod paths {
    pub const HEALTH: &str = "/health";
    pub const STATUS: &str = "/status";
    pub const EVENTS: &str = "/events";
    pub const LOGS: &str = "/logs/{code}";

    /// First path segments that never resolve to a mapping
    pub const RESERVED_SEGMENTS: &[&str] = &["health", "status", "events", "logs"];
}

/// Header name for the session token used by observers
pub const X_SESSION_TOKEN: &str = "x-session-token";

/// Placeholder recorded for header values that are not valid UTF-8
pub const BINARY_VALUE: &str = "<binary>";

/// Headers never written to a record
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "api-key",
    "x-auth-token",
    X_SESSION_TOKEN,
];

/// Headers that identify the calling client's address
pub const CLIENT_IP_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
];

/// Headers that describe the inbound hop and must not cross to the destination
pub const IDENTITY_HEADERS: &[&str] = &["host", "origin", "referer"];

/// Prefix of proxy chain headers dropped under the denylist policy
pub const FORWARDED_PREFIX: &str = "x-forwarded-";

/// Connection-scoped headers (RFC 9110 §7.6.1)
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers forwarded under the allow-list policy when none are configured
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "accept",
    "accept-language",
    "authorization",
    "cache-control",
    "content-type",
    "user-agent",
    "x-request-id",
];

/// Which inbound headers are forwarded upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardingPolicy {
    Denylist,
    Allowlist(HashSet<HeaderName>),
}

/// Configured name of a forwarding policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingPolicyKind {
    Denylist,
    Allowlist,
}

/// Header policy settings as they appear in configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderPolicyConfig {
    /// Explicit policy; when absent the deployment mode decides
    pub policy: Option<ForwardingPolicyKind>,
    /// Names forwarded under the allow-list policy
    pub allowlist: Vec<String>,
    /// Extra names redacted from records
    pub sensitive: Vec<String>,
    /// Whether to send the observed client address as `x-forwarded-for`
    pub forward_client_ip: bool,
}

impl Default for HeaderPolicyConfig {
    fn default() -> Self {
        Self {
            policy: None,
            allowlist: DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            sensitive: Vec::new(),
            forward_client_ip: true,
        }
    }
}

/// Resolved header policy
#[derive(Clone, Debug)]
pub struct HeaderPolicy {
    forwarding: ForwardingPolicy,
    extra_sensitive: HashSet<String>,
    forward_client_ip: bool,
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self::new(ForwardingPolicy::Denylist)
    }
}

impl HeaderPolicy {
    pub fn new(forwarding: ForwardingPolicy) -> Self {
        Self {
            forwarding,
            extra_sensitive: HashSet::new(),
            forward_client_ip: true,
        }
    }

    /// Build the policy for a deployment, honouring an explicit override
    pub fn from_config(config: &HeaderPolicyConfig, mode: DeploymentMode) -> Self {
        let kind = config.policy.unwrap_or(match mode {
            DeploymentMode::Open => ForwardingPolicyKind::Denylist,
            DeploymentMode::Restricted => ForwardingPolicyKind::Allowlist,
        });

        let forwarding = match kind {
            ForwardingPolicyKind::Denylist => ForwardingPolicy::Denylist,
            ForwardingPolicyKind::Allowlist => {
                ForwardingPolicy::Allowlist(parse_header_names(&config.allowlist))
            }
        };

        Self::new(forwarding)
            .with_sensitive(config.sensitive.iter().map(String::as_str))
            .with_client_ip_forwarding(config.forward_client_ip)
    }

    pub fn with_sensitive<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.extra_sensitive
            .extend(names.into_iter().map(|n| n.trim().to_ascii_lowercase()));
        self
    }

    pub fn with_client_ip_forwarding(mut self, enabled: bool) -> Self {
        self.forward_client_ip = enabled;
        self
    }

    /// Whether a header must never appear in a record
    pub fn is_sensitive(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        SENSITIVE_HEADERS.contains(&name.as_str())
            || CLIENT_IP_HEADERS.contains(&name.as_str())
            || self.extra_sensitive.contains(&name)
    }

    /// Copy of `headers` with every sensitive entry removed
    pub fn sanitize_for_log(&self, headers: &HeaderMap) -> RedactedHeaders {
        let mut redacted = BTreeMap::new();

        for name in headers.keys() {
            if self.is_sensitive(name.as_str()) {
                continue;
            }

            let joined = headers
                .get_all(name)
                .iter()
                .map(|value| value.to_str().unwrap_or(BINARY_VALUE))
                .collect::<Vec<_>>()
                .join(", ");

            redacted.insert(name.as_str().to_string(), joined);
        }

        RedactedHeaders::from_map(redacted)
    }

    /// Headers for the outbound request
    ///
    /// `destination_host` is the authority (`host[:port]`) of the rewritten
    /// target. The body is re-framed by the client, so `content-length` is
    /// never copied.
    pub fn build_forward_headers(
        &self,
        headers: &HeaderMap,
        destination_host: &str,
        client_ip: Option<IpAddr>,
    ) -> HeaderMap {
        let mut outbound = HeaderMap::with_capacity(headers.len() + 2);

        for (name, value) in headers {
            let keep = match &self.forwarding {
                ForwardingPolicy::Denylist => !is_stripped_on_forward(name),
                ForwardingPolicy::Allowlist(allowed) => {
                    allowed.contains(name) && !is_hop_by_hop(name) && name != header::HOST
                }
            };

            if keep && name != header::CONTENT_LENGTH {
                outbound.append(name.clone(), value.clone());
            }
        }

        if let Ok(host) = HeaderValue::from_str(destination_host) {
            outbound.insert(header::HOST, host);
        }

        if self.forward_client_ip {
            if let Some(ip) = client_ip {
                if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                    outbound.insert(HeaderName::from_static("x-forwarded-for"), value);
                }
            }
        }

        outbound
    }
}

/// Upstream response headers as relayed to the caller
pub fn relay_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = headers.clone();
    for name in HOP_BY_HOP_HEADERS {
        relayed.remove(*name);
    }
    relayed
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn is_stripped_on_forward(name: &HeaderName) -> bool {
    let name_str = name.as_str();
    IDENTITY_HEADERS.contains(&name_str)
        || name_str.starts_with(FORWARDED_PREFIX)
        || is_hop_by_hop(name)
}

fn parse_header_names(names: &[String]) -> HashSet<HeaderName> {
    names
        .iter()
        .filter_map(|name| match HeaderName::from_bytes(name.trim().as_bytes()) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(header = %name, "Ignoring invalid header name in allow-list");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("relay.local:8080"));
        headers.insert("origin", HeaderValue::from_static("https://ui.local"));
        headers.insert("referer", HeaderValue::from_static("https://ui.local/page"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-length", HeaderValue::from_static("7"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer xyz"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers
    }

    #[test]
    fn sanitize_removes_sensitive_and_client_ip_headers() {
        let policy = HeaderPolicy::default();
        let mut headers = inbound();
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("x-api-key", HeaderValue::from_static("secret"));

        let redacted = policy.sanitize_for_log(&headers);

        assert!(!redacted.contains("authorization"));
        assert!(!redacted.contains("cookie"));
        assert!(!redacted.contains("x-api-key"));
        assert!(!redacted.contains("x-forwarded-for"));
        assert_eq!(redacted.get("content-type"), Some("application/json"));
        assert_eq!(redacted.get("x-custom"), Some("kept"));
    }

    #[test]
    fn sanitize_does_not_mutate_input() {
        let policy = HeaderPolicy::default();
        let headers = inbound();
        let before = headers.clone();

        let _ = policy.sanitize_for_log(&headers);

        assert_eq!(headers, before);
    }

    #[test]
    fn sanitize_joins_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let redacted = HeaderPolicy::default().sanitize_for_log(&headers);
        assert_eq!(redacted.get("accept"), Some("text/html, application/json"));
    }

    #[test]
    fn configured_sensitive_names_are_case_insensitive() {
        let policy = HeaderPolicy::default().with_sensitive(["X-Tenant-Secret"]);
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-secret", HeaderValue::from_static("s3cr3t"));

        assert!(policy.is_sensitive("X-TENANT-SECRET"));
        assert!(policy.sanitize_for_log(&headers).is_empty());
    }

    #[test]
    fn denylist_forwards_everything_but_identity_and_hop_headers() {
        let policy = HeaderPolicy::default().with_client_ip_forwarding(false);
        let outbound = policy.build_forward_headers(&inbound(), "example.test", None);

        assert_eq!(outbound.get("host").unwrap(), "example.test");
        assert!(outbound.get("origin").is_none());
        assert!(outbound.get("referer").is_none());
        assert!(outbound.get("x-forwarded-for").is_none());
        assert!(outbound.get("x-forwarded-proto").is_none());
        assert!(outbound.get("connection").is_none());
        assert!(outbound.get("content-length").is_none());
        assert_eq!(outbound.get("authorization").unwrap(), "Bearer xyz");
        assert_eq!(outbound.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn allowlist_forwards_only_listed_headers() {
        let config = HeaderPolicyConfig {
            policy: Some(ForwardingPolicyKind::Allowlist),
            allowlist: vec!["Content-Type".to_string(), "host".to_string()],
            sensitive: Vec::new(),
            forward_client_ip: false,
        };
        let policy = HeaderPolicy::from_config(&config, DeploymentMode::Open);

        let outbound = policy.build_forward_headers(&inbound(), "example.test:8443", None);

        assert_eq!(outbound.len(), 2);
        assert_eq!(outbound.get("content-type").unwrap(), "application/json");
        assert_eq!(outbound.get("host").unwrap(), "example.test:8443");
    }

    #[test]
    fn deployment_mode_selects_default_policy() {
        let config = HeaderPolicyConfig::default();

        let open = HeaderPolicy::from_config(&config, DeploymentMode::Open);
        assert_eq!(open.forwarding, ForwardingPolicy::Denylist);

        let restricted = HeaderPolicy::from_config(&config, DeploymentMode::Restricted);
        assert!(matches!(
            &restricted.forwarding,
            ForwardingPolicy::Allowlist(names) if names.contains(&header::AUTHORIZATION)
        ));
    }

    #[test]
    fn client_ip_replaces_inbound_forwarded_for() {
        let policy = HeaderPolicy::default();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();

        let outbound = policy.build_forward_headers(&inbound(), "example.test", Some(ip));

        let values: Vec<_> = outbound.get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "192.0.2.7");
    }

    #[test]
    fn relayed_response_headers_drop_hop_by_hop_only() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("set-cookie", HeaderValue::from_static("a=b"));

        let relayed = relay_response_headers(&headers);

        assert!(relayed.get("transfer-encoding").is_none());
        assert!(relayed.get("connection").is_none());
        assert_eq!(relayed.get("content-type").unwrap(), "text/plain");
        assert_eq!(relayed.get("set-cookie").unwrap(), "a=b");
    }

    fn random_case(name: &str, mask: u64) -> String {
        name.chars()
            .enumerate()
            .map(|(i, c)| {
                if mask & (1 << (i % 64)) != 0 {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn redaction_is_complete_for_any_casing(
            mask in any::<u64>(),
            index in 0..SENSITIVE_HEADERS.len(),
            value in "[a-zA-Z0-9 =;]{1,32}",
        ) {
            let name = random_case(SENSITIVE_HEADERS[index], mask);
            let mut headers = HeaderMap::new();
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(&value).unwrap(),
            );
            headers.insert("x-safe", HeaderValue::from_static("1"));

            let redacted = HeaderPolicy::default().sanitize_for_log(&headers);

            prop_assert!(!redacted.contains(SENSITIVE_HEADERS[index]));
            prop_assert_eq!(redacted.get("x-safe"), Some("1"));
        }

        #[test]
        fn redaction_is_idempotent(
            names in proptest::collection::vec("[a-z][a-z-]{0,15}", 0..8),
            mask in any::<u64>(),
        ) {
            let policy = HeaderPolicy::default().with_sensitive(["x-secret"]);
            let mut headers = HeaderMap::new();
            for name in names.iter().chain(["authorization".to_string(), "x-secret".to_string()].iter()) {
                let cased = random_case(name, mask);
                headers.append(
                    HeaderName::from_bytes(cased.as_bytes()).unwrap(),
                    HeaderValue::from_static("v"),
                );
            }

            let once = policy.sanitize_for_log(&headers);

            let mut rebuilt = HeaderMap::new();
            for (name, value) in once.iter() {
                rebuilt.insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
            }
            let twice = policy.sanitize_for_log(&rebuilt);

            prop_assert_eq!(once, twice);
        }
    }
}
