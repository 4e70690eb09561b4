//! Type definitions for the proxy module

use crate::domain::MappingCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ========== Constants ==========

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Default ceiling for inbound request bodies
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// Default ceiling for request bytes kept in a record
pub const DEFAULT_REQUEST_CAPTURE_LIMIT: usize = 5 * 1024 * 1024;

/// Default ceiling for response bytes kept in a record
pub const DEFAULT_RESPONSE_CAPTURE_LIMIT: usize = 50 * 1024 * 1024;

/// Default upstream timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default path segment that short-circuits forwarding with a mock response
pub const DEFAULT_MOCK_SEGMENT: &str = "__mock__";

/// Default capacity of the persistence queue
pub const DEFAULT_LOG_QUEUE_CAPACITY: usize = 1024;

/// Status recorded when the caller hung up before the exchange finished
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Deployment profile; selects the default header forwarding policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Forward everything except identity and hop-by-hop headers
    #[default]
    #[display("open")]
    Open,
    /// Forward only an explicit allow-list of headers
    #[display("restricted")]
    Restricted,
}

/// Forwarding configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Inbound bodies larger than this are rejected with 413
    pub max_request_size: usize,
    /// Request bytes kept in the record before switching to a marker
    pub request_capture_limit: usize,
    /// Response bytes kept in the record before switching to a marker
    pub response_capture_limit: usize,
    /// Upstream timeout, measured until response headers arrive
    pub request_timeout: Duration,
    /// First path segment after the code that triggers a mock response
    pub mock_segment: String,
    /// Media types refused with 415
    pub denied_content_types: Vec<String>,
    /// Records waiting for persistence before new ones are dropped
    pub log_queue_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            request_capture_limit: DEFAULT_REQUEST_CAPTURE_LIMIT,
            response_capture_limit: DEFAULT_RESPONSE_CAPTURE_LIMIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            mock_segment: DEFAULT_MOCK_SEGMENT.to_string(),
            denied_content_types: Vec::new(),
            log_queue_capacity: DEFAULT_LOG_QUEUE_CAPACITY,
        }
    }
}

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No active mapping for code '{code}'")]
    NotFound { code: String },

    #[error("Mapping {code} has an invalid destination: {reason}")]
    InvalidConfiguration { code: MappingCode, reason: String },

    #[error("Upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnection(String),

    #[error("Client disconnected before the exchange completed")]
    ClientDisconnected,

    #[error("Request body of {size} bytes exceeds the limit of {max_size} bytes")]
    PayloadTooLarge { size: u64, max_size: usize },

    #[error("Content type '{0}' is not accepted")]
    UnsupportedMediaType(String),

    #[error("Rate limit exceeded, retry in {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Failed to persist exchange record: {0}")]
    PersistenceFailure(String),

    #[error("Failed to deliver to observer: {0}")]
    BroadcastFailure(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Access to mapping '{0}' denied")]
    Forbidden(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn not_found(code: impl Into<String>) -> Self {
        Self::NotFound { code: code.into() }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
