//! The asynchronous, size-rotated access-log file writer.
//!
//! [`AsyncFileWriter`] decouples request handling from disk I/O. Producers
//! push finished [`LogRecord`]s into a bounded queue; a dedicated thread owns
//! the file, appends records in queue order and rotates the file before a
//! write would push it over the size threshold. Nothing but that thread ever
//! touches the file handle or the size counter.
//!
//! Shutdown follows a reject-after-close policy: once [`AsyncFileWriter::close`]
//! starts, the queue stops accepting records, everything already queued is
//! written, and the file is flushed, synced and closed before `close` returns.

use chrono::Local;
use futures::executor::block_on;
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    future::Future,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{
    mpsc::{
        self,
        error::{SendError, TrySendError},
    },
    oneshot, Mutex,
};
use tracing::{debug, error, info, warn};

use crate::error::{AccessLogError, Result};
use crate::pool::{BufferPool, LogRecord};
use crate::types::{SharedState, WriterState};

/// Size at which the active file is rotated (1800 MiB).
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1800;
/// Default in-memory write buffer in front of the file.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default depth of the record queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Destination for finished access-log records.
///
/// The middleware only ever calls [`submit`](LogSink::submit), from the
/// request path, so implementations must not block on I/O there.
pub trait LogSink: Send + Sync + 'static {
    /// Hands over one record. Never reports failure to the caller.
    fn submit(&self, record: LogRecord);

    /// Records accepted but not yet persisted.
    fn queue_depth(&self) -> usize;

    /// Persists everything accepted so far and releases the destination.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Called once when the writer hits an unrecoverable I/O error.
pub type FatalHandler = Arc<dyn Fn(&AccessLogError) + Send + Sync>;

/// Logs the error and terminates the process.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|err| {
        error!(error = %err, "Access log writer failed, terminating");
        std::process::exit(1);
    })
}

/// Tuning knobs for [`AsyncFileWriter`].
#[derive(Clone)]
pub struct WriterOptions {
    /// Bytes buffered in memory before hitting the file.
    pub buffer_size: usize,
    /// Maximum number of queued records before producers wait.
    pub queue_capacity: usize,
    /// Rotation threshold in bytes.
    pub max_file_size: u64,
    pub fatal_handler: FatalHandler,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_file_size: MAX_FILE_SIZE,
            fatal_handler: exit_on_fatal(),
        }
    }
}

impl std::fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterOptions")
            .field("buffer_size", &self.buffer_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Command {
    Write(LogRecord),
    Shutdown,
}

/// Asynchronous, size-rotated, append-only file writer.
pub struct AsyncFileWriter {
    path: PathBuf,
    tx: mpsc::Sender<Command>,
    state: Arc<SharedState>,
    done: Mutex<Option<oneshot::Receiver<Result<()>>>>,
    pool: Arc<BufferPool>,
}

impl AsyncFileWriter {
    /// Opens `path` for appending (creating it and its parent directories as
    /// needed) and starts the writer thread.
    ///
    /// The current file length counts toward the rotation threshold.
    pub fn open(
        path: impl Into<PathBuf>,
        pool: Arc<BufferPool>,
        options: WriterOptions,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| AccessLogError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let file = open_append(&path)?;
        let size = file
            .metadata()
            .map_err(|source| AccessLogError::Open {
                path: path.clone(),
                source,
            })?
            .len();

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let state = Arc::new(SharedState::new(WriterState::Open));

        let worker = Worker {
            path: path.clone(),
            out: Some(BufWriter::with_capacity(options.buffer_size, file)),
            size,
            max_size: options.max_file_size,
            buffer_size: options.buffer_size,
            pool: pool.clone(),
            state: state.clone(),
            fatal: options.fatal_handler,
        };
        std::thread::Builder::new()
            .name("accesslog-writer".to_string())
            .spawn(move || worker.run(rx, done_tx))
            .map_err(AccessLogError::Spawn)?;

        info!(path = %path.display(), size, "Access log opened");

        Ok(Self {
            path,
            tx,
            state,
            done: Mutex::new(Some(done_rx)),
            pool,
        })
    }

    pub fn state(&self) -> WriterState {
        self.state.get()
    }

    /// Enqueues `record`, waiting for queue capacity if the queue is full.
    ///
    /// Returns [`AccessLogError::Closed`] once shutdown has begun.
    pub async fn log(&self, record: LogRecord) -> Result<()> {
        self.tx
            .send(Command::Write(record))
            .await
            .map_err(|SendError(command)| {
                recycle(&self.pool, command);
                AccessLogError::Closed
            })
    }

    /// Current number of queued records.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Drains the queue, then flushes, syncs and closes the file.
    ///
    /// Returns the fatal error if the writer failed earlier. Concurrent calls
    /// wait until the file is closed; every call after that returns `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        let mut done = self.done.lock().await;
        let Some(receiver) = done.as_mut() else {
            return Ok(());
        };

        self.state.advance(WriterState::Closing);
        debug!(path = %self.path.display(), depth = self.queue_depth(), "Closing access log");

        // Fails only when the worker already stopped; `receiver` then carries why.
        let _ = self.tx.send(Command::Shutdown).await;
        let result = receiver.await.unwrap_or(Err(AccessLogError::WorkerGone));
        *done = None;
        result
    }

    /// Queues without awaiting. On a full queue the calling thread blocks
    /// until the worker frees a slot, so records keep their submission order.
    fn enqueue(&self, record: LogRecord) {
        let command = match self.tx.try_send(Command::Write(record)) {
            Ok(()) => return,
            Err(TrySendError::Full(command)) => command,
            Err(TrySendError::Closed(command)) => {
                warn!(path = %self.path.display(), "Access log is closed, dropping record");
                recycle(&self.pool, command);
                return;
            }
        };

        debug!(path = %self.path.display(), "Access log queue full, waiting for the writer");
        if let Err(SendError(command)) = block_on(self.tx.send(command)) {
            warn!(
                path = %self.path.display(),
                "Access log closed while waiting for queue space, dropping record"
            );
            recycle(&self.pool, command);
        }
    }
}

impl LogSink for AsyncFileWriter {
    fn submit(&self, record: LogRecord) {
        self.enqueue(record);
    }

    fn queue_depth(&self) -> usize {
        AsyncFileWriter::queue_depth(self)
    }

    async fn close(&self) -> Result<()> {
        AsyncFileWriter::close(self).await
    }
}

fn recycle(pool: &BufferPool, command: Command) {
    if let Command::Write(record) = command {
        pool.recycle_line(record);
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AccessLogError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// `<path>-YYYYMMDDHHMMSS`, with a `.N` counter if that name is taken.
fn rotated_path(path: &Path) -> PathBuf {
    let mut base = OsString::from(path.as_os_str());
    base.push(format!("-{}", Local::now().format("%Y%m%d%H%M%S")));

    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        let mut name = base.clone();
        name.push(format!(".{n}"));
        candidate = PathBuf::from(name);
        n += 1;
    }
    candidate
}

/// State owned by the writer thread.
struct Worker {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    size: u64,
    max_size: u64,
    buffer_size: usize,
    pool: Arc<BufferPool>,
    state: Arc<SharedState>,
    fatal: FatalHandler,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::Receiver<Command>, done: oneshot::Sender<Result<()>>) {
        let result = self.consume(&mut rx).and_then(|()| self.finish());

        match &result {
            Ok(()) => {
                self.state.set(WriterState::Closed);
                info!(path = %self.path.display(), "Access log closed");
            }
            Err(err) => {
                self.state.set(WriterState::Failed);
                rx.close();
                error!(path = %self.path.display(), error = %err, "Access log writer failed");
                (self.fatal)(err);
            }
        }
        let _ = done.send(result);
    }

    /// Writes records until shutdown or until every producer is gone.
    fn consume(&mut self, rx: &mut mpsc::Receiver<Command>) -> Result<()> {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Write(record) => self.write(record)?,
                Command::Shutdown => {
                    debug!(path = %self.path.display(), "Shutdown requested, draining queue");
                    rx.close();
                }
            }
        }
        Ok(())
    }

    fn write_error(&self, source: std::io::Error) -> AccessLogError {
        AccessLogError::Write {
            path: self.path.clone(),
            source,
        }
    }

    fn write(&mut self, record: LogRecord) -> Result<()> {
        let len = record.len() as u64;
        // an empty file is never rotated, even for an oversized record
        if self.size > 0 && self.size + len > self.max_size {
            self.rotate()?;
        }

        let written = match self.out.as_mut() {
            Some(out) => out.write_all(record.as_bytes()),
            None => Err(std::io::Error::other("log file is not open")),
        };
        self.pool.recycle_line(record);
        written.map_err(|source| self.write_error(source))?;

        self.size += len;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(out) = self.out.take() {
            let file = out
                .into_inner()
                .map_err(|err| self.write_error(err.into_error()))?;
            drop(file);
        }

        let target = rotated_path(&self.path);
        fs::rename(&self.path, &target).map_err(|source| AccessLogError::Rotate {
            from: self.path.clone(),
            to: target.clone(),
            source,
        })?;

        let file = open_append(&self.path)?;
        self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.out = Some(BufWriter::with_capacity(self.buffer_size, file));

        info!(
            path = %self.path.display(),
            rotated = %target.display(),
            "Access log rotated"
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush().map_err(|source| self.write_error(source))?;
            out.get_ref()
                .sync_all()
                .map_err(|source| self.write_error(source))?;
        }
        Ok(())
    }
}
