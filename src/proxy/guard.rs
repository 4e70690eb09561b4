//! Rate and size guard for forwarded traffic
//!
//! Fixed-window counting per client key. The window for a key is updated
//! while holding the map entry, so concurrent requests from one client can
//! never both take the last slot.

use crate::domain::ClientKey;
use crate::proxy::capture::media_type;
use crate::proxy::types::{ProxyError, ProxyResult, DEFAULT_MAX_REQUEST_SIZE};
use dashmap::DashMap;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Fallback header consulted after the configured client-IP header
const REAL_IP_HEADER: &str = "x-real-ip";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
    /// Header carrying the client address when behind a trusted proxy
    pub client_ip_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window: Duration::from_secs(60),
            client_ip_header: "x-forwarded-for".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RequestGuard {
    config: RateLimitConfig,
    windows: DashMap<ClientKey, Window>,
    max_request_size: usize,
    denied_content_types: Vec<String>,
}

impl RequestGuard {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            denied_content_types: Vec::new(),
        }
    }

    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    pub fn with_denied_content_types(mut self, content_types: &[String]) -> Self {
        self.denied_content_types = content_types
            .iter()
            .map(String::as_str)
            .map(media_type)
            .collect();
        self
    }

    pub fn admit(&self, key: &ClientKey) -> Admission {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &ClientKey, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed {
                remaining: self.config.max_requests,
            };
        }

        let mut window = self.windows.entry(key.clone()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.config.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.config.max_requests {
            let retry_after = self
                .config
                .window
                .saturating_sub(now.saturating_duration_since(window.started));
            return Admission::Denied { retry_after };
        }

        window.count += 1;
        Admission::Allowed {
            remaining: self.config.max_requests - window.count,
        }
    }

    /// Drop windows that have fully elapsed; returns the number removed
    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Instant::now())
    }

    pub fn purge_stale_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let window = self.config.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    pub fn check_size(&self, content_length: Option<u64>) -> ProxyResult<()> {
        match content_length {
            Some(size) if size > self.max_request_size as u64 => Err(ProxyError::PayloadTooLarge {
                size,
                max_size: self.max_request_size,
            }),
            _ => Ok(()),
        }
    }

    pub fn check_content_type(&self, content_type: Option<&str>) -> ProxyResult<()> {
        let Some(content_type) = content_type else {
            return Ok(());
        };

        let media_type = media_type(content_type);
        if self.denied_content_types.iter().any(|denied| *denied == media_type) {
            return Err(ProxyError::UnsupportedMediaType(media_type));
        }
        Ok(())
    }

    /// Bucket key for a request
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientKey {
        client_address(headers, &self.config.client_ip_header, peer)
            .map(ClientKey::new)
            .unwrap_or_else(ClientKey::unknown)
    }

    /// Client address as an IP, when one can be determined
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        client_address(headers, &self.config.client_ip_header, peer)
            .and_then(|address| address.parse().ok())
    }
}

fn first_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn client_address(headers: &HeaderMap, header: &str, peer: Option<SocketAddr>) -> Option<String> {
    first_header_value(headers, header)
        .or_else(|| first_header_value(headers, REAL_IP_HEADER))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn guard(max_requests: u32) -> RequestGuard {
        RequestGuard::new(RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
            ..RateLimitConfig::default()
        })
    }

    fn key(value: &str) -> ClientKey {
        ClientKey::new(value.to_string())
    }

    #[test]
    fn admits_up_to_limit_then_denies() {
        let guard = guard(3);
        let now = Instant::now();
        let client = key("10.0.0.1");

        for expected_remaining in [2, 1, 0] {
            assert_eq!(
                guard.admit_at(&client, now),
                Admission::Allowed {
                    remaining: expected_remaining
                }
            );
        }

        match guard.admit_at(&client, now + Duration::from_secs(20)) {
            Admission::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(40)),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let guard = guard(1);
        let now = Instant::now();
        let client = key("10.0.0.1");

        assert!(matches!(guard.admit_at(&client, now), Admission::Allowed { .. }));
        assert!(matches!(guard.admit_at(&client, now), Admission::Denied { .. }));
        assert!(matches!(
            guard.admit_at(&client, now + Duration::from_secs(60)),
            Admission::Allowed { .. }
        ));
    }

    #[test]
    fn clients_are_counted_independently() {
        let guard = guard(1);
        let now = Instant::now();

        assert!(matches!(guard.admit_at(&key("a"), now), Admission::Allowed { .. }));
        assert!(matches!(guard.admit_at(&key("b"), now), Admission::Allowed { .. }));
        assert!(matches!(guard.admit_at(&key("a"), now), Admission::Denied { .. }));
    }

    #[test]
    fn disabled_guard_always_admits() {
        let guard = RequestGuard::new(RateLimitConfig {
            enabled: false,
            max_requests: 0,
            ..RateLimitConfig::default()
        });

        assert!(matches!(guard.admit(&key("a")), Admission::Allowed { .. }));
        assert_eq!(guard.tracked_clients(), 0);
    }

    #[test]
    fn concurrent_admissions_never_exceed_limit() {
        let guard = std::sync::Arc::new(guard(50));
        let client = key("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = std::sync::Arc::clone(&guard);
                let client = client.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| matches!(guard.admit(&client), Admission::Allowed { .. }))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn stale_windows_are_purged() {
        let guard = guard(5);
        let now = Instant::now();
        guard.admit_at(&key("a"), now);
        guard.admit_at(&key("b"), now + Duration::from_secs(30));

        assert_eq!(guard.purge_stale_at(now + Duration::from_secs(61)), 1);
        assert_eq!(guard.tracked_clients(), 1);
    }

    #[test]
    fn size_and_media_type_checks() {
        let guard = RequestGuard::new(RateLimitConfig::default())
            .with_max_request_size(10)
            .with_denied_content_types(&["application/zip".to_string()]);

        assert!(guard.check_size(None).is_ok());
        assert!(guard.check_size(Some(10)).is_ok());
        assert!(matches!(
            guard.check_size(Some(11)),
            Err(ProxyError::PayloadTooLarge { size: 11, max_size: 10 })
        ));

        assert!(guard.check_content_type(Some("application/json")).is_ok());
        assert!(matches!(
            guard.check_content_type(Some("Application/Zip; charset=binary")),
            Err(ProxyError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn client_key_prefers_configured_header_then_real_ip_then_peer() {
        let guard = guard(1);
        let peer: SocketAddr = "192.0.2.1:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(guard.client_key(&headers, None), ClientKey::unknown());
        assert_eq!(guard.client_key(&headers, Some(peer)).as_ref(), "192.0.2.1");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(guard.client_key(&headers, Some(peer)).as_ref(), "198.51.100.2");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(guard.client_key(&headers, Some(peer)).as_ref(), "203.0.113.9");
        assert_eq!(
            guard.client_ip(&headers, Some(peer)),
            Some("203.0.113.9".parse().unwrap())
        );
    }
}
