//! Reusable byte buffers for log lines and body captures.
//!
//! Every request needs one line buffer and two capture buffers. They are
//! recycled through a [`BufferPool`] shared by the middleware (which acquires)
//! and the writer (which releases line buffers once they hit the disk).

use bytes::BytesMut;
use std::sync::{Mutex, PoisonError};

/// Reserved capacity of a log-line buffer.
pub const LINE_BUFFER_CAPACITY: usize = 8 * 1024;
/// Reserved capacity of a body-capture buffer.
pub const CAPTURE_BUFFER_CAPACITY: usize = 4 * 1024;

/// The two buffer classes handed out by [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    Line,
    Capture,
}

impl BufferClass {
    pub fn capacity(self) -> usize {
        match self {
            BufferClass::Line => LINE_BUFFER_CAPACITY,
            BufferClass::Capture => CAPTURE_BUFFER_CAPACITY,
        }
    }
}

/// An unbounded free-list allocator for [`BufferClass`] buffers.
///
/// The pool never shrinks; after a burst it holds as many buffers as were
/// in flight at the peak.
#[derive(Debug, Default)]
pub struct BufferPool {
    lines: Mutex<Vec<BytesMut>>,
    captures: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn free_list(&self, class: BufferClass) -> &Mutex<Vec<BytesMut>> {
        match class {
            BufferClass::Line => &self.lines,
            BufferClass::Capture => &self.captures,
        }
    }

    /// Returns an empty buffer with at least the class capacity reserved.
    pub fn acquire(&self, class: BufferClass) -> BytesMut {
        let recycled = self
            .free_list(class)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(class.capacity());
                buf
            }
            None => BytesMut::with_capacity(class.capacity()),
        }
    }

    /// Resets `buf` and puts it back on the free list for `class`.
    pub fn release(&self, class: BufferClass, mut buf: BytesMut) {
        buf.clear();
        self.free_list(class)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }

    /// Number of idle buffers of `class` currently held.
    pub fn idle(&self, class: BufferClass) -> usize {
        self.free_list(class)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn line(&self) -> LogRecord {
        LogRecord {
            buf: self.acquire(BufferClass::Line),
        }
    }

    pub fn capture(&self, limit: usize) -> CaptureBuffer {
        CaptureBuffer {
            buf: self.acquire(BufferClass::Capture),
            limit,
            overflowed: false,
        }
    }

    pub fn recycle_line(&self, record: LogRecord) {
        self.release(BufferClass::Line, record.buf);
    }

    pub fn recycle_capture(&self, capture: CaptureBuffer) {
        self.release(BufferClass::Capture, capture.buf);
    }
}

/// One pre-formatted access-log line.
///
/// Ownership moves formatter -> queue -> writer -> pool; the bytes are never
/// touched again once the record has been submitted.
#[derive(Debug, Default)]
pub struct LogRecord {
    buf: BytesMut,
}

impl LogRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl From<&[u8]> for LogRecord {
    fn from(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
        }
    }
}

impl From<&str> for LogRecord {
    fn from(line: &str) -> Self {
        line.as_bytes().into()
    }
}

/// A side buffer that mirrors at most `limit` bytes of a body.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    buf: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl CaptureBuffer {
    /// Mirrors `chunk` if the whole chunk still fits under the limit.
    ///
    /// The first chunk that would cross the limit ends mirroring for good, so
    /// the buffer only ever holds a contiguous prefix of the body.
    pub fn offer(&mut self, chunk: &[u8]) -> bool {
        if self.overflowed || self.buf.len() + chunk.len() > self.limit {
            self.overflowed = true;
            return false;
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_fresh_buffers_have_class_capacity() {
        let pool = BufferPool::new();
        let line = pool.acquire(BufferClass::Line);
        let capture = pool.acquire(BufferClass::Capture);

        assert!(line.is_empty());
        assert!(line.capacity() >= LINE_BUFFER_CAPACITY);
        assert!(capture.capacity() >= CAPTURE_BUFFER_CAPACITY);
    }

    #[test]
    fn test_release_resets_and_reuses() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(BufferClass::Line);
        buf.extend_from_slice(b"stale");
        pool.release(BufferClass::Line, buf);
        assert_eq!(pool.idle(BufferClass::Line), 1);
        assert_eq!(pool.idle(BufferClass::Capture), 0);

        let buf = pool.acquire(BufferClass::Line);
        assert!(buf.is_empty());
        assert_eq!(pool.idle(BufferClass::Line), 0);
    }

    #[test]
    fn test_capture_stops_at_limit() {
        let pool = BufferPool::new();
        let mut capture = pool.capture(8);

        assert!(capture.offer(b"abcd"));
        assert!(capture.offer(b"efgh"));
        assert!(!capture.offer(b"i"));
        assert_eq!(capture.as_bytes(), b"abcdefgh");
        // even an empty chunk is refused once the limit was crossed
        assert!(!capture.offer(b""));

        pool.recycle_capture(capture);
        assert_eq!(pool.idle(BufferClass::Capture), 1);
    }

    #[test]
    fn test_oversized_chunk_is_not_mirrored() {
        let pool = BufferPool::new();
        let mut capture = pool.capture(4);
        assert!(!capture.offer(b"too long"));
        assert!(capture.is_empty());

        // later chunks that would fit are not mirrored either
        assert!(!capture.offer(b"ok"));
        assert!(capture.is_empty());
    }
}
