//! Data types shared by the middleware, the formatter and the writer.

use axum::{
    extract::ConnectInfo,
    http::{header, request::Parts, HeaderMap, Method, Uri},
};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

/// Request metadata snapshotted before the request is handed to the inner
/// service.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// `Host` header, falling back to the URI authority.
    pub host: String,
    /// Peer address as `ip:port`, empty when the server does not expose it.
    pub remote_addr: String,
    /// Declared body length, `-1` when unknown.
    pub content_length: i64,
}

impl RequestMeta {
    /// Snapshots `parts`. `size_hint` is the body's exact size, if known, and
    /// is only consulted when there is no usable `Content-Length` header.
    pub fn from_parts(parts: &Parts, size_hint: Option<u64>) -> Self {
        let host = parts
            .headers
            .get(header::HOST)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default();

        let content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .or_else(|| size_hint.and_then(|n| i64::try_from(n).ok()))
            .unwrap_or(-1);

        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            host,
            remote_addr,
            content_length,
        }
    }

    /// Path plus query string, as the client sent it.
    pub fn request_uri(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// Runtime switches for body capture, shared by every clone of one
/// middleware instance.
#[derive(Debug, Default)]
pub struct CaptureToggles {
    request: AtomicBool,
    response: AtomicBool,
}

impl CaptureToggles {
    pub fn new(request: bool, response: bool) -> Self {
        Self {
            request: AtomicBool::new(request),
            response: AtomicBool::new(response),
        }
    }

    pub fn request(&self) -> bool {
        self.request.load(Ordering::Relaxed)
    }

    pub fn response(&self) -> bool {
        self.response.load(Ordering::Relaxed)
    }

    pub fn set_request(&self, on: bool) {
        self.request.store(on, Ordering::Relaxed);
    }

    pub fn set_response(&self, on: bool) {
        self.response.store(on, Ordering::Relaxed);
    }
}

/// Health snapshot of the logging pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStat {
    /// Records accepted but not yet written.
    pub queue_depth: usize,
}

/// Lifecycle of an [`AsyncFileWriter`](crate::writer::AsyncFileWriter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    /// Accepting records; the worker is running.
    Open = 0,
    /// `close()` has started; queued records are being drained.
    Closing = 1,
    /// Everything was written, flushed and the file closed.
    Closed = 2,
    /// A write or rotation failed; the worker has stopped.
    Failed = 3,
}

/// [`WriterState`] cell readable from any thread.
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new(state: WriterState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> WriterState {
        match self.0.load(Ordering::Acquire) {
            0 => WriterState::Open,
            1 => WriterState::Closing,
            2 => WriterState::Closed,
            _ => WriterState::Failed,
        }
    }

    pub(crate) fn set(&self, state: WriterState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves to `next` unless the writer already failed.
    pub(crate) fn advance(&self, next: WriterState) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != WriterState::Failed as u8).then_some(next as u8)
            });
    }
}
