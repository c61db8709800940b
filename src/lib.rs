//! # accesslog
//!
//! An Axum/Tower middleware that writes one tab-separated access-log line per
//! request to a local file, without putting disk I/O on the request path.
//!
//! ## Features
//!
//! - **Asynchronous writer**: lines are queued and appended by a dedicated
//!   thread, in order, with a bounded queue for backpressure
//! - **Size-based rotation**: the active file is renamed to
//!   `<file>-YYYYMMDDHHMMSS` before it would grow past the threshold
//! - **Bounded body capture**: request and response bodies of textual content
//!   types are mirrored up to a fixed limit, switchable at runtime
//! - **Pooled buffers**: line and capture buffers are recycled between requests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use accesslog::{AccessLogConfig, AccessLogLayer};
//! use axum::{routing::post, Json, Router};
//! use serde_json::{json, Value};
//!
//! async fn login(Json(_body): Json<Value>) -> Json<Value> {
//!     Json(json!({ "name": "peter", "age": 12 }))
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layer = AccessLogLayer::new(AccessLogConfig {
//!         filename: "./access/example.log".into(),
//!         request_body: true,
//!         response_body: true,
//!         ..AccessLogConfig::default()
//!     })?;
//!     let controls = layer.controls();
//!
//!     let app = Router::new().route("/login", post(login)).layer(layer);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app)
//!         .with_graceful_shutdown(async { let _ = tokio::signal::ctrl_c().await; })
//!         .await?;
//!
//!     // drain the queue and close the file
//!     controls.flush().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Line format
//!
//! See [`format`] for the ten tab-separated fields of each line.

use axum::{body::Body, extract::Request, response::Response};
use serde::Deserialize;
use std::{
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::{Instant, SystemTime},
};
use tower::{Layer, Service};
use tracing::{debug, instrument};

pub mod body_wrapper;
use body_wrapper::{
    is_capturable, BodyCapture, PendingLine, RequestBody, ResponseBody, SharedCapture,
};

pub mod error;
pub use error::AccessLogError;

pub mod format;
pub mod headers;

pub mod pool;
pub use pool::{BufferPool, LogRecord};

pub mod stream_writer;
pub use stream_writer::StreamWriter;

pub mod types;
pub use types::{CaptureToggles, HealthStat, RequestMeta, WriterState};

pub mod writer;
pub use writer::{AsyncFileWriter, FatalHandler, LogSink, WriterOptions};

/// Configuration for the access-log middleware.
///
/// Deserializable so it can sit inside an application's own config file;
/// every field but `filename` has a default.
///
/// # Examples
///
/// ```rust
/// use accesslog::AccessLogConfig;
///
/// let config = AccessLogConfig {
///     filename: "/var/log/app/access.log".into(),
///     request_body: true,
///     ..AccessLogConfig::default()
/// };
/// assert_eq!(config.buffer_size, 4096);
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Path of the active log file. Rotated files sit next to it.
    pub filename: PathBuf,
    /// Initial state of request body capture
    pub request_body: bool,
    /// Initial state of response body capture
    pub response_body: bool,
    /// Bytes buffered in memory in front of the file
    pub buffer_size: usize,
    /// Depth of the record queue
    pub queue_capacity: usize,
    /// Rotation threshold in bytes
    pub max_file_size: u64,
    /// Maximum bytes mirrored per body
    pub capture_limit: usize,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from("access.log"),
            request_body: false,
            response_body: false,
            buffer_size: writer::DEFAULT_BUFFER_SIZE,
            queue_capacity: writer::DEFAULT_QUEUE_CAPACITY,
            max_file_size: writer::MAX_FILE_SIZE,
            capture_limit: pool::CAPTURE_BUFFER_CAPACITY,
        }
    }
}

impl AccessLogConfig {
    fn capture_limit(&self) -> usize {
        match self.capture_limit {
            0 => pool::CAPTURE_BUFFER_CAPACITY,
            n => n,
        }
    }

    /// Writer options for this config; zero sizes fall back to the defaults.
    pub fn writer_options(&self, fatal_handler: FatalHandler) -> WriterOptions {
        let defaults = Self::default();
        WriterOptions {
            buffer_size: match self.buffer_size {
                0 => defaults.buffer_size,
                n => n,
            },
            queue_capacity: match self.queue_capacity {
                0 => defaults.queue_capacity,
                n => n,
            },
            max_file_size: match self.max_file_size {
                0 => defaults.max_file_size,
                n => n,
            },
            fatal_handler,
        }
    }
}

/// Tower layer for the access-log middleware.
///
/// Every service produced by one layer shares the same sink, buffer pool and
/// capture toggles; use [`AccessLogLayer::controls`] to reach them while the
/// server is running.
///
/// # Examples
///
/// ```rust,no_run
/// use accesslog::{AccessLogConfig, AccessLogLayer};
/// use axum::{routing::get, Router};
///
/// # async fn hello() -> &'static str { "Hello" }
/// # fn main() -> Result<(), accesslog::AccessLogError> {
/// let layer = AccessLogLayer::new(AccessLogConfig {
///     filename: "logs/access.log".into(),
///     ..AccessLogConfig::default()
/// })?;
/// let app: Router = Router::new().route("/hello", get(hello)).layer(layer);
/// # Ok(())
/// # }
/// ```
pub struct AccessLogLayer<S = AsyncFileWriter> {
    sink: Arc<S>,
    pool: Arc<BufferPool>,
    toggles: Arc<CaptureToggles>,
    capture_limit: usize,
}

impl AccessLogLayer<AsyncFileWriter> {
    /// Opens the log file and starts its writer thread.
    ///
    /// A fatal write error later on terminates the process; see
    /// [`with_fatal_handler`](Self::with_fatal_handler) to react differently.
    pub fn new(config: AccessLogConfig) -> Result<Self, AccessLogError> {
        Self::with_fatal_handler(config, writer::exit_on_fatal())
    }

    pub fn with_fatal_handler(
        config: AccessLogConfig,
        fatal_handler: FatalHandler,
    ) -> Result<Self, AccessLogError> {
        let pool = Arc::new(BufferPool::new());
        let writer = AsyncFileWriter::open(
            &config.filename,
            pool.clone(),
            config.writer_options(fatal_handler),
        )?;
        Ok(Self::with_sink(&config, Arc::new(writer), pool))
    }
}

impl<S: LogSink> AccessLogLayer<S> {
    /// Builds a layer around an existing sink. `pool` should be the pool the
    /// sink recycles line buffers into.
    pub fn with_sink(config: &AccessLogConfig, sink: Arc<S>, pool: Arc<BufferPool>) -> Self {
        Self {
            sink,
            pool,
            toggles: Arc::new(CaptureToggles::new(
                config.request_body,
                config.response_body,
            )),
            capture_limit: config.capture_limit(),
        }
    }

    /// Runtime handle for toggling capture, health checks and shutdown.
    pub fn controls(&self) -> AccessLogControls<S> {
        AccessLogControls {
            sink: self.sink.clone(),
            toggles: self.toggles.clone(),
        }
    }
}

impl<S> Clone for AccessLogLayer<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            pool: self.pool.clone(),
            toggles: self.toggles.clone(),
            capture_limit: self.capture_limit,
        }
    }
}

impl<T, S> Layer<T> for AccessLogLayer<S> {
    type Service = AccessLogService<T, S>;

    fn layer(&self, inner: T) -> Self::Service {
        AccessLogService {
            inner,
            sink: self.sink.clone(),
            pool: self.pool.clone(),
            toggles: self.toggles.clone(),
            capture_limit: self.capture_limit,
        }
    }
}

/// Runtime controls of one middleware instance.
pub struct AccessLogControls<S = AsyncFileWriter> {
    sink: Arc<S>,
    toggles: Arc<CaptureToggles>,
}

impl<S> Clone for AccessLogControls<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            toggles: self.toggles.clone(),
        }
    }
}

impl<S: LogSink> AccessLogControls<S> {
    /// Switches request body capture for requests arriving from now on.
    pub fn set_request_body(&self, on: bool) {
        self.toggles.set_request(on);
    }

    /// Switches response body capture for requests arriving from now on.
    pub fn set_response_body(&self, on: bool) {
        self.toggles.set_response(on);
    }

    pub fn request_body(&self) -> bool {
        self.toggles.request()
    }

    pub fn response_body(&self) -> bool {
        self.toggles.response()
    }

    pub fn health(&self) -> HealthStat {
        HealthStat {
            queue_depth: self.sink.queue_depth(),
        }
    }

    /// Drains every queued line to disk and closes the sink.
    pub async fn flush(&self) -> Result<(), AccessLogError> {
        self.sink.close().await
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }
}

/// Returns the request capture buffer to the pool when the service future
/// ends without a response, whether by error or by being dropped.
struct CaptureGuard {
    capture: SharedCapture,
    pool: Arc<BufferPool>,
    armed: bool,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if self.armed {
            let buffer = self
                .capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take_buffer();
            self.pool.recycle_capture(buffer);
        }
    }
}

/// Tower service implementation for the access-log middleware.
///
/// Wraps the request body before calling the inner service and the response
/// body afterwards. The line is submitted when the response body finishes
/// streaming (or is dropped), so the elapsed time and the response size cover
/// the whole response.
///
/// Users typically don't interact with this type directly - it's created by
/// [`AccessLogLayer`].
pub struct AccessLogService<T, S = AsyncFileWriter> {
    inner: T,
    sink: Arc<S>,
    pool: Arc<BufferPool>,
    toggles: Arc<CaptureToggles>,
    capture_limit: usize,
}

impl<T: Clone, S> Clone for AccessLogService<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sink: self.sink.clone(),
            pool: self.pool.clone(),
            toggles: self.toggles.clone(),
            capture_limit: self.capture_limit,
        }
    }
}

impl<T, S> Service<Request> for AccessLogService<T, S>
where
    T: Service<Request, Response = Response> + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Send + 'static,
    S: LogSink,
{
    type Response = Response;
    type Error = T::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        let started_at = SystemTime::now();
        let timer = Instant::now();

        let (parts, body) = request.into_parts();
        let request_meta =
            RequestMeta::from_parts(&parts, http_body::Body::size_hint(&body).exact());

        // both toggles are read once, when the request arrives
        let capture_request = self.toggles.request() && is_capturable(&parts.headers);
        let capture_response = self.toggles.response();

        debug!(
            method = %request_meta.method,
            uri = %request_meta.uri,
            capture_request,
            capture_response,
            "Wrapping request for access log"
        );

        let request_capture = Arc::new(Mutex::new(BodyCapture::new(
            self.pool.capture(self.capture_limit),
            capture_request,
        )));
        let body = Body::new(RequestBody::new(body, request_capture.clone()));
        let future = self.inner.call(Request::from_parts(parts, body));

        let sink = self.sink.clone();
        let pool = self.pool.clone();
        let capture_limit = self.capture_limit;
        let mut guard = CaptureGuard {
            capture: request_capture.clone(),
            pool: pool.clone(),
            armed: true,
        };

        Box::pin(async move {
            let response = match future.await {
                Ok(response) => response,
                Err(e) => {
                    debug!("Inner service failed, no access log line");
                    return Err(e);
                }
            };
            // the response body owns the request capture from here on
            guard.armed = false;

            let (parts, body) = response.into_parts();
            let pending = PendingLine {
                started_at,
                timer,
                request: request_meta,
                request_capture,
                status: parts.status,
                headers: parts.headers.clone(),
                sink,
                pool: pool.clone(),
            };
            let body = ResponseBody::new(
                body,
                pool.capture(capture_limit),
                capture_response,
                pending,
            );

            Ok(Response::from_parts(parts, Body::new(body)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferClass;
    use std::convert::Infallible;

    fn layer(pool: &Arc<BufferPool>) -> AccessLogLayer<StreamWriter<Vec<u8>>> {
        let config = AccessLogConfig {
            request_body: true,
            ..AccessLogConfig::default()
        };
        let sink = Arc::new(StreamWriter::new(Vec::new(), pool.clone()));
        AccessLogLayer::with_sink(&config, sink, pool.clone())
    }

    #[tokio::test]
    async fn test_request_capture_recycled_when_future_dropped() {
        let pool = Arc::new(BufferPool::new());
        let mut service = layer(&pool).layer(tower::service_fn(|_request: Request| {
            futures::future::pending::<Result<Response, Infallible>>()
        }));

        let mut future = service.call(Request::new(Body::from("abandoned")));
        assert!(futures::poll!(&mut future).is_pending());
        assert_eq!(pool.idle(BufferClass::Capture), 0);

        drop(future);
        assert_eq!(pool.idle(BufferClass::Capture), 1);
    }

    #[tokio::test]
    async fn test_request_capture_recycled_on_inner_error() {
        let pool = Arc::new(BufferPool::new());
        let mut service = layer(&pool).layer(tower::service_fn(|_request: Request| async {
            Err::<Response, _>(std::io::Error::other("backend down"))
        }));

        let result = service.call(Request::new(Body::empty())).await;
        assert!(result.is_err());
        assert_eq!(pool.idle(BufferClass::Capture), 1);
        // no line was formatted
        assert_eq!(pool.idle(BufferClass::Line), 0);
    }
}
