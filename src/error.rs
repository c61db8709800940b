//! Error types for the access-log writer and middleware.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by the access logger.
///
/// Construction errors (`CreateDir`, `Open`, `Spawn`) are returned to whoever
/// builds the writer. `Write` and `Rotate` are fatal to the writer: they are
/// reported through its fatal handler and returned from `close()`.
#[derive(Debug, thiserror::Error)]
pub enum AccessLogError {
    #[error("cannot create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open access log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write access log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot rotate access log {from} to {to}: {source}")]
    Rotate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start access log writer thread: {0}")]
    Spawn(#[source] io::Error),

    /// The writer has been closed and no longer accepts records.
    #[error("access log writer is closed")]
    Closed,

    /// The writer thread exited without reporting a result.
    #[error("access log writer thread exited unexpectedly")]
    WorkerGone,
}

pub type Result<T, E = AccessLogError> = std::result::Result<T, E>;
