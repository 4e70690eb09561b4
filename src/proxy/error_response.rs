//! Unified error response handling for the relay
//!
//! Every error leaving the service is a JSON object with `error`, `message`,
//! `timestamp` and `requestId`. `details` is only attached to internal
//! failures.

use crate::domain::RequestId;
use crate::proxy::types::{ProxyError, REQUEST_ID_HEADER, STATUS_CLIENT_CLOSED_REQUEST};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Error category for programmatic handling
    pub error: String,
    /// Human-readable error message
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Request ID for correlation
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert to HTTP response with the request id header attached
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = HeaderValue::from_str(&self.request_id).ok();
        let mut response = (status, Json(self)).into_response();

        if let Some(value) = request_id {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Machine-readable category
    fn category(&self) -> &'static str;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;

    /// Convert to standardized error response
    fn to_error_response(&self, request_id: RequestId) -> ErrorResponse;
}

impl ErrorResponseExt for ProxyError {
    fn category(&self) -> &'static str {
        use ProxyError::*;

        match self {
            NotFound { .. } => "NOT_FOUND",
            InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            UpstreamConnection(_) => "UPSTREAM_CONNECTION_ERROR",
            ClientDisconnected => "CLIENT_DISCONNECTED",
            PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            RateLimited { .. } => "RATE_LIMITED",
            PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            BroadcastFailure(_) => "BROADCAST_FAILURE",
            Unauthorized => "UNAUTHORIZED",
            Forbidden(_) => "FORBIDDEN",
            StoreUnavailable(_) => "SERVICE_UNAVAILABLE",
            Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            NotFound { .. } => StatusCode::NOT_FOUND,
            InvalidConfiguration { .. } => StatusCode::BAD_REQUEST,
            UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            UpstreamConnection(_) => StatusCode::BAD_GATEWAY,
            ClientDisconnected => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden(_) => StatusCode::FORBIDDEN,
            StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PersistenceFailure(_) | BroadcastFailure(_) | Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn to_error_response(&self, request_id: RequestId) -> ErrorResponse {
        let response = ErrorResponse::new(self.category(), self.to_string(), request_id);

        match self {
            ProxyError::Internal(cause) => {
                response.with_details(serde_json::json!({ "cause": cause }))
            }
            _ => response,
        }
    }
}

/// A proxy error bound to the request it belongs to
#[derive(Debug)]
pub struct ScopedError {
    pub error: ProxyError,
    pub request_id: RequestId,
}

impl ScopedError {
    pub fn new(error: ProxyError, request_id: RequestId) -> Self {
        Self { error, request_id }
    }
}

impl IntoResponse for ScopedError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let mut response = self
            .error
            .to_error_response(self.request_id)
            .into_response_with_status(status);

        if let ProxyError::RateLimited { retry_after } = &self.error {
            let seconds = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
