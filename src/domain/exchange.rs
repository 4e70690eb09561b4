//! Exchange records: one forwarded request/response pair

use crate::domain::identifiers::{ExchangeId, MappingCode, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much of a body made it into the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    /// No bytes were sent
    Empty,
    /// Every byte is in the record
    Complete,
    /// Content type is not loggable, a placeholder was stored
    NotLoggable,
    /// Body exceeded the capture ceiling, a marker was stored
    TooLarge,
    /// The stream ended early, the stored bytes are a prefix
    Incomplete,
}

impl CaptureStatus {
    /// Whether a reader can trust the stored body as the whole story
    pub fn is_faithful(self) -> bool {
        matches!(self, Self::Empty | Self::Complete | Self::NotLoggable)
    }
}

/// Body as it is stored in a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedBody {
    pub content: String,
    pub status: CaptureStatus,
    /// Bytes observed on the wire, including any not stored
    pub size: u64,
}

impl CapturedBody {
    pub fn empty() -> Self {
        Self {
            content: String::new(),
            status: CaptureStatus::Empty,
            size: 0,
        }
    }

    /// Body holding a diagnostic message rather than wire bytes
    pub fn message(message: impl Into<String>) -> Self {
        let content = message.into();
        Self {
            size: content.len() as u64,
            content,
            status: CaptureStatus::Complete,
        }
    }
}

/// Header map after sensitive entries were removed
///
/// Names are lowercase; repeated headers are joined with `", "`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedactedHeaders(BTreeMap<String, String>);

impl RedactedHeaders {
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Persisted description of a forwarded request and its response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub id: ExchangeId,
    pub request_id: RequestId,
    pub mapping_code: MappingCode,
    pub requested_url: String,
    pub target_url: String,
    pub method: String,
    pub request_headers: RedactedHeaders,
    pub response_headers: RedactedHeaders,
    pub request_body: String,
    pub request_body_status: CaptureStatus,
    pub request_body_size: u64,
    pub response_body: String,
    pub response_body_status: CaptureStatus,
    pub response_body_size: u64,
    pub incomplete: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub mock: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}
