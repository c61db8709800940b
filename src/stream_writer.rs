//! Synchronous [`LogSink`] writing each record straight to a stream.
//!
//! There is no queue and no rotation, which makes [`StreamWriter`] handy for
//! logging to stdout in development and for capturing lines in tests.

use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::warn;

use crate::error::{AccessLogError, Result};
use crate::pool::{BufferPool, LogRecord};
use crate::writer::LogSink;

/// Writes records to any [`Write`] implementation as they are submitted.
///
/// # Examples
///
/// ```rust
/// use accesslog::{BufferPool, LogSink, StreamWriter};
/// use std::sync::Arc;
///
/// let sink = StreamWriter::new(Vec::new(), Arc::new(BufferPool::new()));
/// sink.submit("1\tGET\t/\n".into());
/// assert_eq!(sink.queue_depth(), 0);
/// assert_eq!(sink.into_inner(), b"1\tGET\t/\n");
/// ```
pub struct StreamWriter<W> {
    inner: Mutex<W>,
    pool: Arc<BufferPool>,
}

impl<W: Write + Send + 'static> StreamWriter<W> {
    pub fn new(inner: W, pool: Arc<BufferPool>) -> Self {
        Self {
            inner: Mutex::new(inner),
            pool,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send + 'static> LogSink for StreamWriter<W> {
    fn submit(&self, record: LogRecord) {
        let written = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(record.as_bytes());
        if let Err(err) = written {
            warn!(error = %err, "Failed to write access log record to stream");
        }
        self.pool.recycle_line(record);
    }

    fn queue_depth(&self) -> usize {
        0
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .map_err(|source| AccessLogError::Write {
                path: PathBuf::from("<stream>"),
                source,
            })
    }
}
