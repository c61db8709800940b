//! Pass-through body wrappers that mirror a bounded prefix of each body.
//!
//! [`RequestBody`] and [`ResponseBody`] forward every frame and error of the
//! wrapped body unchanged; they only copy data-frame bytes into a
//! [`CaptureBuffer`] while capture is enabled and the capture limit allows.
//! The response wrapper also owns the request's pending log line and submits
//! it once the response body has been fully sent or dropped.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, StatusCode},
};
use http_body::{Frame, SizeHint};
use std::{
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{ready, Context, Poll},
    time::{Instant, SystemTime},
};
use tracing::trace;

use crate::format::LineFields;
use crate::pool::{BufferPool, CaptureBuffer};
use crate::types::RequestMeta;
use crate::writer::LogSink;

/// Media types whose bodies are worth logging.
const CAPTURABLE_MEDIA_TYPES: [&str; 5] = [
    "application/json",
    "text/plain",
    "application/x-www-form-urlencoded",
    "application/xml",
    "text/xml",
];

/// Whether `content_type` names a capturable media type. Parameters after `;`
/// are ignored.
pub fn is_capturable_media_type(content_type: &str) -> bool {
    let media_type = content_type
        .split_once(';')
        .map_or(content_type, |(media_type, _)| media_type);
    CAPTURABLE_MEDIA_TYPES.contains(&media_type)
}

/// Whether the `Content-Type` of `headers` allows body capture.
pub fn is_capturable(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_capturable_media_type)
}

/// Capture state of one body: the mirror buffer plus the byte count.
#[derive(Debug, Default)]
pub struct BodyCapture {
    buffer: CaptureBuffer,
    enabled: bool,
    seen: u64,
}

impl BodyCapture {
    pub fn new(buffer: CaptureBuffer, enabled: bool) -> Self {
        Self {
            buffer,
            enabled,
            seen: 0,
        }
    }

    /// Counts `chunk` and mirrors it when capture is enabled.
    pub fn observe(&mut self, chunk: &[u8]) {
        self.seen += chunk.len() as u64;
        if self.enabled {
            self.buffer.offer(chunk);
        }
    }

    pub fn captured(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Total bytes that passed through, captured or not.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn take_buffer(&mut self) -> CaptureBuffer {
        std::mem::take(&mut self.buffer)
    }
}

/// Request capture shared between the body handed to the inner service and
/// the response side that formats the line.
pub type SharedCapture = Arc<Mutex<BodyCapture>>;

/// Request body wrapper.
pub struct RequestBody {
    inner: Body,
    capture: SharedCapture,
}

impl RequestBody {
    pub fn new(inner: Body, capture: SharedCapture) -> Self {
        Self { inner, capture }
    }
}

impl http_body::Body for RequestBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        if let Some(data) = frame.as_ref().and_then(|f| f.as_ref().ok()?.data_ref()) {
            this.capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(data);
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// A log line waiting for its response body to finish.
pub(crate) struct PendingLine<S> {
    pub(crate) started_at: SystemTime,
    pub(crate) timer: Instant,
    pub(crate) request: RequestMeta,
    pub(crate) request_capture: SharedCapture,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) sink: Arc<S>,
    pub(crate) pool: Arc<BufferPool>,
}

/// Response body wrapper.
///
/// Whether the body is captured is decided on the first data frame: the
/// runtime toggle must have been on when the request arrived and the
/// response `Content-Type` must be capturable. The decision then holds for
/// the rest of the body.
pub struct ResponseBody<S: LogSink> {
    inner: Body,
    capture: BodyCapture,
    gated: bool,
    pending: Option<PendingLine<S>>,
}

impl<S: LogSink> ResponseBody<S> {
    pub(crate) fn new(
        inner: Body,
        capture: CaptureBuffer,
        enabled: bool,
        pending: PendingLine<S>,
    ) -> Self {
        Self {
            inner,
            capture: BodyCapture::new(capture, enabled),
            gated: false,
            pending: Some(pending),
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        if !self.gated {
            self.gated = true;
            let allowed = self
                .pending
                .as_ref()
                .is_some_and(|pending| is_capturable(&pending.headers));
            self.capture.enabled = self.capture.enabled && allowed;
        }
        self.capture.observe(chunk);
    }

    /// Formats and submits the line, then returns both capture buffers to the
    /// pool. Runs at most once.
    fn finish(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let mut request_capture = pending
            .request_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut record = pending.pool.line();
        LineFields {
            started_at: pending.started_at,
            request: &pending.request,
            request_body: request_capture.captured(),
            status: pending.status,
            response_headers: &pending.headers,
            response_body: self.capture.captured(),
            response_size: self.capture.seen(),
            elapsed: pending.timer.elapsed(),
        }
        .write_to(&mut record);

        trace!(
            method = %pending.request.method,
            uri = %pending.request.uri,
            status = pending.status.as_u16(),
            bytes = self.capture.seen(),
            "Submitting access log line"
        );
        pending.sink.submit(record);

        pending.pool.recycle_capture(request_capture.take_buffer());
        pending.pool.recycle_capture(self.capture.take_buffer());
    }
}

impl<S: LogSink> http_body::Body for ResponseBody<S> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            Some(Ok(f)) => {
                if let Some(data) = f.data_ref() {
                    this.observe(data);
                }
                // hyper may stop polling as soon as the body reports its end
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Some(Err(_)) | None => this.finish(),
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<S: LogSink> Drop for ResponseBody<S> {
    fn drop(&mut self) {
        self.finish();
    }
}
