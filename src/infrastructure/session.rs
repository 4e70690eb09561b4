//! Session verification for observers
//!
//! Sessions are issued elsewhere; the relay only asks whether a token is
//! valid and which identity it belongs to.

use crate::proxy::forwarding::{build_client, HttpsClient};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Verified owner of a session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionIdentity {
    pub subject: String,
}

impl SessionIdentity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session service unavailable: {0}")]
    Unavailable(String),

    #[error("Session service returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl From<SessionError> for crate::proxy::ProxyError {
    fn from(error: SessionError) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// `Ok(None)` when the token is unknown or expired
    async fn verify(&self, token: &str) -> Result<Option<SessionIdentity>, SessionError>;
}

/// Fixed token table, configured for development and tests
#[derive(Debug, Clone, Default)]
pub struct StaticSessionValidator {
    tokens: HashMap<String, SessionIdentity>,
}

impl StaticSessionValidator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, subject)| (token, SessionIdentity::new(subject)))
                .collect(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens
            .insert(token.into(), SessionIdentity::new(subject));
        self
    }
}

#[async_trait]
impl SessionValidator for StaticSessionValidator {
    async fn verify(&self, token: &str) -> Result<Option<SessionIdentity>, SessionError> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// Asks a session service over HTTP
///
/// Sends `GET <url>` with the token as a bearer credential. 200 with
/// `{"subject": ...}` is a valid session; 401, 403 and 404 mean the token
/// is not valid; anything else is reported as unavailable.
#[derive(Clone)]
pub struct HttpSessionValidator {
    url: Uri,
    client: HttpsClient,
    timeout: Duration,
}

impl HttpSessionValidator {
    pub fn new(url: Uri, timeout: Duration) -> Self {
        Self {
            url,
            client: build_client(),
            timeout,
        }
    }
}

#[async_trait]
impl SessionValidator for HttpSessionValidator {
    async fn verify(&self, token: &str) -> Result<Option<SessionIdentity>, SessionError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::ACCEPT, "application/json")
            .body(Full::<Bytes>::default())
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| SessionError::Unavailable(format!("no response within {:?}", self.timeout)))?
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!(%status, "Session rejected");
                return Ok(None);
            }
            other => {
                warn!(status = %other, "Session service returned unexpected status");
                return Err(SessionError::Unavailable(format!("status {other}")));
            }
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SessionError::Unavailable(e.to_string()))?
            .to_bytes();

        serde_json::from_slice::<SessionIdentity>(&body)
            .map(Some)
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))
    }
}
