//! Forwarding engine
//!
//! Resolves the mapping for an inbound request, rewrites it onto the
//! destination, forwards it, and relays the response while the exchange is
//! captured. Requests are never retried.

use crate::domain::RequestId;
use crate::infrastructure::MappingStore;
use crate::proxy::capture::{BodyCapture, ResponseCapture, TeeBody};
use crate::proxy::headers::{relay_response_headers, HeaderPolicy};
use crate::proxy::mock::MockEcho;
use crate::proxy::recorder::{ExchangeDraft, ExchangeRecorder, InFlightExchange};
use crate::proxy::types::*;
use crate::proxy::url_resolver::{RoutedPath, UrlResolver};
use axum::body::Body;
use bytes::Bytes;
use chrono::Utc;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outbound client used for forwarding and collaborator calls
pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Marks relayed responses produced by the mock marker
pub const X_MOCK_RESPONSE: &str = "x-interceptor-mock";

/// Client for http and https destinations
pub fn build_client() -> HttpsClient {
    let connector = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    Client::builder(TokioExecutor::new()).build(connector)
}

#[derive(Clone)]
pub struct ForwardingEngine {
    mappings: Arc<dyn MappingStore>,
    header_policy: Arc<HeaderPolicy>,
    recorder: ExchangeRecorder,
    client: HttpsClient,
    config: Arc<ProxyConfig>,
}

impl ForwardingEngine {
    pub fn new(
        config: ProxyConfig,
        mappings: Arc<dyn MappingStore>,
        header_policy: HeaderPolicy,
        recorder: ExchangeRecorder,
    ) -> Self {
        Self {
            mappings,
            header_policy: Arc::new(header_policy),
            recorder,
            client: build_client(),
            config: Arc::new(config),
        }
    }

    /// Forward one inbound request
    #[instrument(skip(self, request), fields(method = %request.method(), path = %request.uri().path()))]
    pub async fn handle(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
        request_id: RequestId,
    ) -> ProxyResult<Response<Body>> {
        let routed = UrlResolver::route(request.uri())?;

        let mapping = self
            .mappings
            .lookup(&routed.code)
            .await
            .map_err(ProxyError::from)?
            .ok_or_else(|| ProxyError::not_found(routed.code.to_string()))?;

        let (parts, body) = request.into_parts();
        let requested_url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        if routed.is_mock(&self.config.mock_segment) {
            let body = self.collect_body(&parts.headers, body).await?;
            let target_url = UrlResolver::resolve(&mapping, &routed)
                .map(|uri| uri.to_string())
                .unwrap_or_else(|_| mapping.destination_base_url.clone());
            let draft = self.draft(
                request_id,
                &routed,
                requested_url,
                target_url,
                &parts.method,
                &parts.headers,
                &body,
                true,
            );
            return Ok(self.mock_response(draft, &parts.method, &routed, &body));
        }

        let target = UrlResolver::resolve(&mapping, &routed)?;
        let body = self.collect_body(&parts.headers, body).await?;

        let authority = target
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let outbound_headers =
            self.header_policy
                .build_forward_headers(&parts.headers, &authority, client_ip);

        let draft = self.draft(
            request_id,
            &routed,
            requested_url,
            target.to_string(),
            &parts.method,
            &parts.headers,
            &body,
            false,
        );

        let mut outbound = Request::builder()
            .method(parts.method.clone())
            .uri(target.clone())
            .body(Full::new(body))
            .map_err(|e| ProxyError::Internal(format!("failed to build outbound request: {e}")))?;
        *outbound.headers_mut() = outbound_headers;

        debug!(target = %target, "Forwarding request");
        let in_flight = InFlightExchange::dispatch(draft, self.recorder.clone());

        let timeout = self.config.request_timeout;
        let upstream = match tokio::time::timeout(timeout, self.client.request(outbound)).await {
            Err(_) => {
                let error = ProxyError::UpstreamTimeout(timeout);
                warn!(target = %target, ?timeout, "Upstream timed out");
                in_flight.fail(StatusCode::GATEWAY_TIMEOUT.as_u16(), &error);
                return Err(error);
            }
            Ok(Err(e)) => {
                let error = ProxyError::UpstreamConnection(e.to_string());
                warn!(target = %target, error = %e, "Upstream connection failed");
                in_flight.fail(StatusCode::BAD_GATEWAY.as_u16(), &error);
                return Err(error);
            }
            Ok(Ok(response)) => response,
        };

        let (mut response_parts, response_body) = upstream.into_parts();
        info!(
            target = %target,
            status = response_parts.status.as_u16(),
            "Upstream responded"
        );

        let pending = in_flight.respond(
            response_parts.status.as_u16(),
            self.header_policy.sanitize_for_log(&response_parts.headers),
        );
        let capture = ResponseCapture::new(
            BodyCapture::new(&response_parts.headers, self.config.response_capture_limit),
            pending,
        );
        response_parts.headers = relay_response_headers(&response_parts.headers);

        Ok(Response::from_parts(
            response_parts,
            Body::new(TeeBody::new(response_body, capture)),
        ))
    }

    async fn collect_body(&self, headers: &HeaderMap, body: Body) -> ProxyResult<Bytes> {
        let max_size = self.config.max_request_size;

        Limited::new(body, max_size)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    let declared = headers
                        .get(header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    ProxyError::PayloadTooLarge {
                        size: declared.unwrap_or(max_size as u64 + 1),
                        max_size,
                    }
                } else {
                    ProxyError::Internal(format!("failed to read request body: {e}"))
                }
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn draft(
        &self,
        request_id: RequestId,
        routed: &RoutedPath,
        requested_url: String,
        target_url: String,
        method: &http::Method,
        headers: &HeaderMap,
        body: &Bytes,
        mock: bool,
    ) -> ExchangeDraft {
        ExchangeDraft {
            request_id,
            mapping_code: routed.code.clone(),
            requested_url,
            target_url,
            method: method.to_string(),
            request_headers: self.header_policy.sanitize_for_log(headers),
            request_body: BodyCapture::capture_complete(
                headers,
                self.config.request_capture_limit,
                body,
            ),
            mock,
            timestamp: Utc::now(),
        }
    }

    fn mock_response(
        &self,
        draft: ExchangeDraft,
        method: &http::Method,
        routed: &RoutedPath,
        body: &Bytes,
    ) -> Response<Body> {
        let echo = MockEcho::new(method.as_str(), routed, body).to_bytes();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(X_MOCK_RESPONSE, HeaderValue::from_static("true"));

        let in_flight = InFlightExchange::dispatch(draft, self.recorder.clone());
        let pending = in_flight.respond(
            StatusCode::OK.as_u16(),
            self.header_policy.sanitize_for_log(&headers),
        );
        pending.complete(
            BodyCapture::capture_complete(&headers, self.config.response_capture_limit, &echo),
            None,
        );

        let mut response = Response::new(Body::from(echo));
        *response.headers_mut() = headers;
        response
    }
}
