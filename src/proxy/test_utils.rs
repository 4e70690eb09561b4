//! Test utilities for proxy module testing
//!
//! Stub upstreams bound on ephemeral ports, a relay wired to in-memory
//! stores, and helpers for reading records off the observer hub.

#[cfg(test)]
pub mod test_helpers {
    use crate::domain::{ExchangeRecord, Mapping, MappingCode};
    use crate::infrastructure::{InMemoryLogStore, InMemoryMappingStore, StaticSessionValidator};
    use crate::proxy::guard::RateLimitConfig;
    use crate::proxy::headers::HeaderPolicy;
    use crate::proxy::observer_hub::{HubMessage, ObserverConfig, Subscription};
    use crate::proxy::service::{RelayComponents, RelayService};
    use crate::proxy::types::*;
    use axum::{
        body::Body,
        extract::{Request, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::any,
        Json, Router,
    };
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Upstream response delay used by `/api/slow`
    pub const SLOW_RESPONSE_DELAY: Duration = Duration::from_secs(2);

    /// Upstream timeout used by test relays
    pub const TEST_REQUEST_TIMEOUT: Duration = Duration::from_millis(300);

    /// Code registered by `test_relay` against the stub upstream
    pub const TEST_CODE: &str = "ab12cd";

    /// Owner of `TEST_CODE`
    pub const TEST_OWNER: &str = "alice";

    /// Session token that resolves to `TEST_OWNER`
    pub const OWNER_TOKEN: &str = "alice-token";

    /// Session token of a user owning nothing
    pub const STRANGER_TOKEN: &str = "bob-token";

    /// Upstream server on an ephemeral port that counts every hit
    pub struct StubUpstream {
        pub addr: SocketAddr,
        hits: Arc<AtomicUsize>,
    }

    impl StubUpstream {
        pub async fn start() -> Self {
            let hits = Arc::new(AtomicUsize::new(0));

            let app = Router::new()
                .route("/api/slow", any(slow_handler))
                .route("/api/stream", any(stream_handler))
                .route("/api/binary", any(binary_handler))
                .fallback(echo_handler)
                .with_state(Arc::clone(&hits));

            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .expect("ephemeral port should bind");
            let addr = listener.local_addr().expect("bound listener has an address");

            tokio::spawn(async move {
                axum::serve(listener, app).await.expect("stub upstream failed");
            });

            Self { addr, hits }
        }

        pub fn base_url(&self) -> String {
            format!("http://{}", self.addr)
        }

        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    /// Echo the request back as JSON
    async fn echo_handler(State(hits): State<Arc<AtomicUsize>>, request: Request) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .unwrap_or_default();

        let headers: serde_json::Map<String, serde_json::Value> = parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    serde_json::Value::String(v.to_str().unwrap_or("<binary>").to_string()),
                )
            })
            .collect();

        (
            StatusCode::OK,
            [("set-cookie", "upstream=1"), ("x-upstream", "stub")],
            Json(serde_json::json!({
                "method": parts.method.to_string(),
                "uri": parts.uri.to_string(),
                "headers": headers,
                "body": String::from_utf8_lossy(&body),
            })),
        )
            .into_response()
    }

    async fn slow_handler(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(SLOW_RESPONSE_DELAY).await;
        (StatusCode::OK, "Slow response")
    }

    /// Two chunks with a pause between them
    async fn stream_handler(State(hits): State<Arc<AtomicUsize>>) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);

        let chunks = futures_util::stream::unfold(0u8, |step| async move {
            match step {
                0 => Some((Ok::<_, std::io::Error>(Bytes::from_static(b"first ")), 1)),
                1 => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Some((Ok(Bytes::from_static(b"second")), 2))
                }
                _ => None,
            }
        });

        Response::builder()
            .header("content-type", "text/plain")
            .body(Body::from_stream(chunks))
            .expect("static response should build")
    }

    async fn binary_handler(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        hits.fetch_add(1, Ordering::SeqCst);
        (
            [("content-type", "application/octet-stream")],
            vec![0u8, 159, 146, 150],
        )
    }

    /// Proxy configuration with short timeouts and small limits
    pub fn test_proxy_config() -> ProxyConfig {
        ProxyConfig {
            max_request_size: 64 * 1024,
            request_capture_limit: 1024,
            response_capture_limit: 1024,
            request_timeout: TEST_REQUEST_TIMEOUT,
            ..ProxyConfig::default()
        }
    }

    /// A relay in front of a stub upstream
    pub struct TestRelay {
        pub service: RelayService,
        pub router: Router,
        pub upstream: StubUpstream,
        pub mappings: Arc<InMemoryMappingStore>,
        pub logs: Arc<InMemoryLogStore>,
    }

    impl TestRelay {
        pub fn code(&self) -> MappingCode {
            MappingCode::try_new(TEST_CODE).expect("test code is valid")
        }

        pub fn subscribe(&self) -> Subscription {
            self.service.state().hub.subscribe(None)
        }
    }

    /// Relay with global access, the open profile, and `TEST_CODE` pointing
    /// at `{upstream}/api`
    pub async fn test_relay() -> TestRelay {
        test_relay_with(|_| {}).await
    }

    pub async fn test_relay_with(customize: impl FnOnce(&mut RelayComponents)) -> TestRelay {
        let upstream = StubUpstream::start().await;

        let mappings = Arc::new(InMemoryMappingStore::with_mappings([Mapping::new(
            MappingCode::try_new(TEST_CODE).expect("test code is valid"),
            format!("{}/api?tenant=t1", upstream.base_url()),
        )
        .with_owner(TEST_OWNER)]));
        let logs = Arc::new(InMemoryLogStore::new());
        let session = Arc::new(
            StaticSessionValidator::default()
                .with_token(OWNER_TOKEN, TEST_OWNER)
                .with_token(STRANGER_TOKEN, "bob"),
        );

        let mut components = RelayComponents {
            proxy: test_proxy_config(),
            header_policy: HeaderPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            purge_interval: Duration::from_secs(60),
            observers: ObserverConfig::default(),
            mode: DeploymentMode::Open,
            global_access: true,
            cors: None,
            mappings: mappings.clone(),
            log_store: logs.clone(),
            session,
        };
        customize(&mut components);

        let service = RelayService::start(components);
        let router = service.router();

        TestRelay {
            service,
            router,
            upstream,
            mappings,
            logs,
        }
    }

    /// Next exchange record on a subscription, skipping control messages
    pub async fn next_record(subscription: &mut Subscription) -> Arc<ExchangeRecord> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match subscription.recv().await {
                    Some(HubMessage::Log(record)) => return record,
                    Some(_) => continue,
                    None => panic!("subscription closed before a record arrived"),
                }
            }
        })
        .await
        .expect("a record should arrive")
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }
}
