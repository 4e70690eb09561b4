//! Exchange recording
//!
//! A forwarded request moves through three states:
//!
//! 1. `InFlightExchange` while the upstream call is outstanding. Dropping it
//!    here means the caller went away; a 499 record is emitted.
//! 2. `PendingResponse` once response headers arrived and the body is being
//!    streamed back.
//! 3. A finished `ExchangeRecord`, handed to the `ExchangeRecorder`.
//!
//! Every path emits exactly one record.

use crate::domain::{
    CapturedBody, ExchangeId, ExchangeRecord, MappingCode, RedactedHeaders, RequestId,
};
use crate::proxy::observer_hub::ObserverHub;
use crate::proxy::types::{ProxyError, STATUS_CLIENT_CLOSED_REQUEST};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fans completed records out to live observers and the persistence queue
#[derive(Clone)]
pub struct ExchangeRecorder {
    hub: Arc<ObserverHub>,
    queue: mpsc::Sender<Arc<ExchangeRecord>>,
}

impl ExchangeRecorder {
    pub fn new(hub: Arc<ObserverHub>, queue: mpsc::Sender<Arc<ExchangeRecord>>) -> Self {
        Self { hub, queue }
    }

    /// Publish a record without waiting on persistence
    pub fn emit(&self, record: ExchangeRecord) {
        let record = Arc::new(record);

        debug!(
            request_id = %record.request_id,
            code = %record.mapping_code,
            status = record.status,
            incomplete = record.incomplete,
            "Exchange recorded"
        );

        let delivered = self.hub.broadcast(Arc::clone(&record));
        debug!(delivered, "Exchange broadcast to observers");

        if let Err(e) = self.queue.try_send(record) {
            let error = ProxyError::PersistenceFailure(match e {
                mpsc::error::TrySendError::Full(_) => "log queue is full".to_string(),
                mpsc::error::TrySendError::Closed(_) => "log writer has stopped".to_string(),
            });
            warn!(error = %error, "Dropping exchange record");
        }
    }
}

/// Request half of a record, known before the upstream call
#[derive(Debug, Clone)]
pub struct ExchangeDraft {
    pub request_id: RequestId,
    pub mapping_code: MappingCode,
    pub requested_url: String,
    pub target_url: String,
    pub method: String,
    pub request_headers: RedactedHeaders,
    pub request_body: CapturedBody,
    pub mock: bool,
    pub timestamp: DateTime<Utc>,
}

impl ExchangeDraft {
    pub fn into_record(
        self,
        status: u16,
        response_headers: RedactedHeaders,
        response_body: CapturedBody,
        error: Option<String>,
        duration_ms: u64,
    ) -> ExchangeRecord {
        let incomplete =
            !self.request_body.status.is_faithful() || !response_body.status.is_faithful();

        ExchangeRecord {
            id: ExchangeId::generate(),
            request_id: self.request_id,
            mapping_code: self.mapping_code,
            requested_url: self.requested_url,
            target_url: self.target_url,
            method: self.method,
            request_headers: self.request_headers,
            response_headers,
            request_body: self.request_body.content,
            request_body_status: self.request_body.status,
            request_body_size: self.request_body.size,
            response_body: response_body.content,
            response_body_status: response_body.status,
            response_body_size: response_body.size,
            incomplete,
            status,
            error,
            mock: self.mock,
            duration_ms,
            timestamp: self.timestamp,
        }
    }
}

/// Exchange waiting on the upstream call
pub struct InFlightExchange {
    draft: Option<ExchangeDraft>,
    recorder: ExchangeRecorder,
    dispatched_at: Instant,
}

impl InFlightExchange {
    /// Start timing; call immediately before dispatch
    pub fn dispatch(draft: ExchangeDraft, recorder: ExchangeRecorder) -> Self {
        Self {
            draft: Some(draft),
            recorder,
            dispatched_at: Instant::now(),
        }
    }

    /// Response headers arrived
    pub fn respond(mut self, status: u16, response_headers: RedactedHeaders) -> PendingResponse {
        PendingResponse {
            draft: self.draft.take(),
            recorder: self.recorder.clone(),
            status,
            response_headers,
            duration_ms: elapsed_ms(self.dispatched_at),
        }
    }

    /// The upstream call failed; records `status` with the error text as body
    pub fn fail(mut self, status: u16, error: &ProxyError) {
        if let Some(draft) = self.draft.take() {
            let message = error.to_string();
            let record = draft.into_record(
                status,
                RedactedHeaders::default(),
                CapturedBody::message(message.clone()),
                Some(message),
                elapsed_ms(self.dispatched_at),
            );
            self.recorder.emit(record);
        }
    }
}

impl Drop for InFlightExchange {
    fn drop(&mut self) {
        if let Some(draft) = self.draft.take() {
            let error = ProxyError::ClientDisconnected;
            let message = error.to_string();
            let record = draft.into_record(
                STATUS_CLIENT_CLOSED_REQUEST,
                RedactedHeaders::default(),
                CapturedBody::message(message.clone()),
                Some(message),
                elapsed_ms(self.dispatched_at),
            );
            self.recorder.emit(record);
        }
    }
}

/// Exchange whose response body is still streaming
pub struct PendingResponse {
    draft: Option<ExchangeDraft>,
    recorder: ExchangeRecorder,
    status: u16,
    response_headers: RedactedHeaders,
    duration_ms: u64,
}

impl PendingResponse {
    pub fn complete(mut self, response_body: CapturedBody, error: Option<String>) {
        if let Some(draft) = self.draft.take() {
            let record = draft.into_record(
                self.status,
                std::mem::take(&mut self.response_headers),
                response_body,
                error,
                self.duration_ms,
            );
            self.recorder.emit(record);
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::CaptureStatus;
    use crate::proxy::observer_hub::ObserverConfig;

    pub(crate) fn draft(code: &str) -> ExchangeDraft {
        ExchangeDraft {
            request_id: RequestId::generate(),
            mapping_code: MappingCode::try_new(code).unwrap(),
            requested_url: format!("/{code}/users"),
            target_url: "http://upstream.test/users".to_string(),
            method: "POST".to_string(),
            request_headers: RedactedHeaders::default(),
            request_body: CapturedBody {
                content: "{}".to_string(),
                status: CaptureStatus::Complete,
                size: 2,
            },
            mock: false,
            timestamp: Utc::now(),
        }
    }

    fn recorder(capacity: usize) -> (ExchangeRecorder, mpsc::Receiver<Arc<ExchangeRecord>>) {
        let hub = Arc::new(ObserverHub::new(ObserverConfig::default()));
        let (tx, rx) = mpsc::channel(capacity);
        (ExchangeRecorder::new(hub, tx), rx)
    }

    #[tokio::test]
    async fn completed_exchange_emits_one_record() {
        let (recorder, mut rx) = recorder(4);

        let in_flight = InFlightExchange::dispatch(draft("ab12cd"), recorder);
        let pending = in_flight.respond(201, RedactedHeaders::default());
        pending.complete(CapturedBody::message("created"), None);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.status, 201);
        assert_eq!(record.response_body, "created");
        assert!(!record.incomplete);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_in_flight_exchange_records_client_disconnect() {
        let (recorder, mut rx) = recorder(4);

        drop(InFlightExchange::dispatch(draft("ab12cd"), recorder));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.status, 499);
        assert!(record.error.as_deref().unwrap().contains("disconnected"));
    }

    #[tokio::test]
    async fn failed_exchange_records_error_as_body() {
        let (recorder, mut rx) = recorder(4);

        InFlightExchange::dispatch(draft("ab12cd"), recorder).fail(
            504,
            &ProxyError::UpstreamTimeout(std::time::Duration::from_millis(100)),
        );

        let record = rx.recv().await.unwrap();
        assert_eq!(record.status, 504);
        assert!(record.response_body.contains("did not respond"));
        assert_eq!(record.error.as_deref(), Some(record.response_body.as_str()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unfaithful_response_body_marks_record_incomplete() {
        let (recorder, mut rx) = recorder(4);

        let pending = InFlightExchange::dispatch(draft("ab12cd"), recorder)
            .respond(200, RedactedHeaders::default());
        pending.complete(
            CapturedBody {
                content: "par".to_string(),
                status: CaptureStatus::Incomplete,
                size: 3,
            },
            Some("reset".to_string()),
        );

        let record = rx.recv().await.unwrap();
        assert!(record.incomplete);
        assert_eq!(record.status, 200);
    }

    #[tokio::test]
    async fn full_queue_drops_record_without_blocking() {
        let (recorder, mut rx) = recorder(1);

        for _ in 0..3 {
            InFlightExchange::dispatch(draft("ab12cd"), recorder.clone())
                .respond(200, RedactedHeaders::default())
                .complete(CapturedBody::empty(), None);
        }

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
