//! Body capture for exchange records
//!
//! `BodyCapture` decides whether a body is loggable and accumulates it up
//! to a ceiling. `TeeBody` wraps an upstream response body so the caller
//! receives every frame as it arrives while a copy feeds the capture; the
//! record is completed when the stream ends, fails, or is dropped.

use crate::domain::{CaptureStatus, CapturedBody};
use crate::proxy::recorder::PendingResponse;
use bytes::{Buf, Bytes};
use http::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// Media type reported when a body without a declared type fails sniffing
const SNIFFED_BINARY_TYPE: &str = "application/octet-stream";

/// Placeholder label for a text body whose bytes are not valid UTF-8
const INVALID_UTF8_LABEL: &str = "text with invalid UTF-8";

/// Whether a declared media type is recorded verbatim
pub fn is_loggable_content_type(content_type: &str) -> bool {
    let media_type = media_type(content_type);

    media_type.starts_with("text/")
        || media_type == "application/json"
        || media_type == "application/xml"
        || media_type == "application/x-www-form-urlencoded"
        || media_type.ends_with("+json")
        || media_type.ends_with("+xml")
}

/// Lowercase media type without parameters
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Sniffing rule for bodies without a declared type
pub fn looks_like_text(chunk: &[u8]) -> bool {
    if chunk.contains(&0) {
        return false;
    }

    match std::str::from_utf8(chunk) {
        Ok(_) => true,
        // A multi-byte character split at the chunk boundary is still text
        Err(e) => e.error_len().is_none(),
    }
}

pub fn placeholder(content_type: &str) -> String {
    format!("[body not captured: {content_type}]")
}

pub fn too_large_marker(limit: usize) -> String {
    format!("[body exceeds capture limit of {limit} bytes]")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Loggability {
    Loggable,
    NotLoggable(String),
    /// No declared type; decided by the first chunk
    Undecided,
}

impl Loggability {
    fn from_headers(headers: &HeaderMap) -> Self {
        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        if let Some(encoding) = encoding {
            if !encoding.is_empty() && encoding != "identity" {
                return Self::NotLoggable(format!("{encoding}-encoded"));
            }
        }

        match headers.get(CONTENT_TYPE).map(|v| v.to_str()) {
            None => Self::Undecided,
            Some(Err(_)) => Self::NotLoggable(SNIFFED_BINARY_TYPE.to_string()),
            Some(Ok(content_type)) if is_loggable_content_type(content_type) => Self::Loggable,
            Some(Ok(content_type)) => Self::NotLoggable(media_type(content_type)),
        }
    }
}

/// Accumulates a body for a record without ever holding more than `limit`
/// bytes
#[derive(Debug)]
pub struct BodyCapture {
    limit: usize,
    loggability: Loggability,
    buffer: Vec<u8>,
    observed: u64,
    overflowed: bool,
}

impl BodyCapture {
    pub fn new(headers: &HeaderMap, limit: usize) -> Self {
        Self {
            limit,
            loggability: Loggability::from_headers(headers),
            buffer: Vec::new(),
            observed: 0,
            overflowed: false,
        }
    }

    /// Capture an already collected body in one step
    pub fn capture_complete(headers: &HeaderMap, limit: usize, body: &[u8]) -> CapturedBody {
        let mut capture = Self::new(headers, limit);
        capture.observe(body);
        capture.finish()
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.observed += chunk.len() as u64;

        if self.loggability == Loggability::Undecided {
            self.loggability = if looks_like_text(chunk) {
                Loggability::Loggable
            } else {
                Loggability::NotLoggable(SNIFFED_BINARY_TYPE.to_string())
            };
        }

        if self.loggability != Loggability::Loggable || self.overflowed {
            return;
        }

        if self.buffer.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.buffer = Vec::new();
        } else {
            self.buffer.extend_from_slice(chunk);
        }
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// The body ended normally
    pub fn finish(&mut self) -> CapturedBody {
        self.build(false)
    }

    /// The body ended early; stored bytes are a prefix at best
    pub fn finish_incomplete(&mut self) -> CapturedBody {
        self.build(true)
    }

    fn build(&mut self, interrupted: bool) -> CapturedBody {
        let size = self.observed;

        let (content, status) = if size == 0 && !interrupted {
            (String::new(), CaptureStatus::Empty)
        } else if let Loggability::NotLoggable(content_type) = &self.loggability {
            (placeholder(content_type), CaptureStatus::NotLoggable)
        } else if self.overflowed {
            (too_large_marker(self.limit), CaptureStatus::TooLarge)
        } else {
            match String::from_utf8(std::mem::take(&mut self.buffer)) {
                Ok(content) => (content, CaptureStatus::Complete),
                // An interrupted prefix may end inside a character
                Err(e) if interrupted => (
                    String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    CaptureStatus::Incomplete,
                ),
                Err(_) => (placeholder(INVALID_UTF8_LABEL), CaptureStatus::NotLoggable),
            }
        };

        let status = if interrupted {
            CaptureStatus::Incomplete
        } else {
            status
        };

        CapturedBody {
            content,
            status,
            size,
        }
    }
}

/// Response side of an exchange: the body capture plus the record waiting
/// for it
///
/// Dropping an unfinished capture completes the record as incomplete.
pub struct ResponseCapture {
    body: BodyCapture,
    pending: Option<PendingResponse>,
}

impl ResponseCapture {
    pub fn new(body: BodyCapture, pending: PendingResponse) -> Self {
        Self {
            body,
            pending: Some(pending),
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.body.observe(chunk);
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.complete(self.body.finish(), None);
        }
    }

    fn fail(&mut self, error: String) {
        if let Some(pending) = self.pending.take() {
            pending.complete(self.body.finish_incomplete(), Some(error));
        }
    }
}

impl Drop for ResponseCapture {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(
                observed = self.body.observed(),
                "Response stream dropped before completion"
            );
            pending.complete(
                self.body.finish_incomplete(),
                Some("response stream closed before completion".to_string()),
            );
        }
    }
}

pin_project! {
    /// Streaming tee: forwards every frame unchanged while feeding a capture
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        capture: Option<ResponseCapture>,
    }
}

impl<B: Body> TeeBody<B> {
    /// A body that is already at its end is never polled by the server, so
    /// its record is completed here
    pub fn new(inner: B, mut capture: ResponseCapture) -> Self {
        let capture = if inner.is_end_stream() {
            capture.finish();
            None
        } else {
            Some(capture)
        };

        Self { inner, capture }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(capture)) = (frame.data_ref(), this.capture.as_mut()) {
                    capture.observe(data.chunk());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(mut capture) = this.capture.take() {
                    capture.fail(format!("upstream body error: {e}"));
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(mut capture) = this.capture.take() {
                    capture.finish();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
