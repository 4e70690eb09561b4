//! Middleware implementations for the relay

use crate::domain::{MappingCode, RequestId};
use crate::infrastructure::log_messages::access as messages;
use crate::infrastructure::{MappingStore, SessionIdentity, SessionValidator};
use crate::proxy::error_response::ScopedError;
use crate::proxy::guard::{Admission, RequestGuard};
use crate::proxy::headers::{paths, X_SESSION_TOKEN};
use crate::proxy::types::*;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const BEARER_PREFIX: &str = "Bearer ";

/// Request ID middleware - every request carries a correlation id
///
/// A valid inbound `x-request-id` is reused as the correlation id. An
/// inbound value that is not a UUID is left on the request untouched and a
/// fresh id is used for correlation only; a missing header is filled in.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let inbound = request.headers().get(REQUEST_ID_HEADER);
    let caller_supplied = inbound.is_some();
    let request_id = inbound
        .and_then(|h| h.to_str().ok())
        .and_then(RequestId::parse)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::from_str(&request_id.to_string()).ok();
    if !caller_supplied {
        if let Some(value) = &header_value {
            request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }
    }
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .copied()
            .or_else(|| {
                parts
                    .headers
                    .get(REQUEST_ID_HEADER)
                    .and_then(|h| h.to_str().ok())
                    .and_then(RequestId::parse)
            })
            .unwrap_or_else(RequestId::generate))
    }
}

/// Logging middleware - logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        request_id = request_id,
        method = %method,
        path = %uri.path(),
        "Incoming request"
    );

    let response = next.run(request).await;
    let duration = start.elapsed();

    info!(
        request_id = request_id,
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

/// Error logging wrapper; failures keep their request id header
pub async fn error_handling_middleware(request: Request, next: Next) -> Response {
    let request_id = request.extensions().get::<RequestId>().copied();

    let response = next.run(request).await.into_response();
    let status = response.status();

    if status.is_server_error() {
        error!(
            request_id = request_id.map(|id| id.to_string()),
            status = status.as_u16(),
            "Request failed"
        );
    } else if status.is_client_error() {
        debug!(
            request_id = request_id.map(|id| id.to_string()),
            status = status.as_u16(),
            "Request rejected"
        );
    }

    response
}

/// Whether a path is served by the relay itself rather than forwarded
pub fn is_control_path(path: &str) -> bool {
    path == paths::HEALTH
        || path == paths::STATUS
        || path == paths::EVENTS
        || path.starts_with("/logs/")
}

/// Rate and size guard for forwarded traffic
pub async fn guard_middleware(
    State(guard): State<Arc<RequestGuard>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_control_path(request.uri().path()) {
        return next.run(request).await;
    }

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .copied()
        .unwrap_or_else(RequestId::generate);
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let client = guard.client_key(request.headers(), peer);
    if let Admission::Denied { retry_after } = guard.admit(&client) {
        warn!(client = %client, ?retry_after, "Rate limit exceeded");
        return ScopedError::new(ProxyError::RateLimited { retry_after }, request_id)
            .into_response();
    }

    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let checked = guard
        .check_size(content_length)
        .and_then(|()| guard.check_content_type(content_type));
    if let Err(error) = checked {
        return ScopedError::new(error, request_id).into_response();
    }

    next.run(request).await
}

/// Session and ownership checks for observer endpoints
pub struct AccessControl {
    global_access: bool,
    validator: Arc<dyn SessionValidator>,
    mappings: Arc<dyn MappingStore>,
}

impl AccessControl {
    pub fn new(
        global_access: bool,
        validator: Arc<dyn SessionValidator>,
        mappings: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            global_access,
            validator,
            mappings,
        }
    }

    pub fn global_access(&self) -> bool {
        self.global_access
    }

    /// Allow access to `code`, or to every mapping when `code` is `None`
    ///
    /// With global access on, no token is needed and ownership is not
    /// checked. Otherwise the caller needs a valid session that owns the
    /// mapping, and a code must be given.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        code: Option<&MappingCode>,
    ) -> ProxyResult<Option<SessionIdentity>> {
        if self.global_access {
            return Ok(None);
        }

        let Some(token) = session_token(headers, query_token) else {
            debug!("{}", messages::TOKEN_MISSING);
            return Err(ProxyError::Unauthorized);
        };

        let Some(identity) = self.validator.verify(&token).await? else {
            warn!("{}", messages::TOKEN_REJECTED);
            return Err(ProxyError::Unauthorized);
        };

        let Some(code) = code else {
            return Err(ProxyError::Forbidden("all mappings".to_string()));
        };

        let owned = self
            .mappings
            .get(code)
            .await?
            .is_some_and(|mapping| mapping.is_owned_by(&identity.subject));

        if !owned {
            warn!(code = %code, subject = %identity.subject, "{}", messages::OWNER_MISMATCH);
            return Err(ProxyError::Forbidden(code.to_string()));
        }

        Ok(Some(identity))
    }
}

/// Session token from `Authorization: Bearer`, `x-session-token`, or the
/// `token` query parameter, in that order
pub fn session_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix(BEARER_PREFIX))
        .map(str::trim);

    let session_header = headers
        .get(X_SESSION_TOKEN)
        .and_then(|h| h.to_str().ok())
        .map(str::trim);

    bearer
        .or(session_header)
        .or(query_token.map(str::trim))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
