//! Error types for the penstock stream engine.
//!
//! Provides a single error enum shared by both sides of the engine. Misuse
//! errors are returned synchronously and never mutate stream state; runtime
//! errors (sink/source/strategy failures, aborts) are stored on the stream
//! and re-delivered through every outstanding and future asynchronous result,
//! which is why the enum is `Clone` and carries owned messages rather than
//! wrapped source errors.

use thiserror::Error;

/// Errors produced by stream operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream is closed; no further operations are accepted.
    #[error("stream is closed")]
    Closed,

    /// The stream is closing; writes submitted after `close()` are refused.
    #[error("stream is closing")]
    Closing,

    /// Close was already requested on this stream or controller.
    #[error("close already requested")]
    CloseRequested,

    /// The stream already has a live reader holding the lock.
    #[error("stream is already locked to a reader")]
    AlreadyLocked,

    /// A reader may not release its lock while read requests are pending.
    #[error("reader has unresolved pending read requests")]
    PendingReads,

    /// A queuing strategy's size function failed; queue accounting is no
    /// longer trustworthy.
    #[error("chunk size calculation failed: {0}")]
    SizeFunction(String),

    /// A sink lifecycle hook failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// A source lifecycle hook failed.
    #[error("source error: {0}")]
    Source(String),

    /// The writable side was aborted with the given reason.
    #[error("stream aborted: {0}")]
    Aborted(String),

    /// The readable side was cancelled with the given reason.
    #[error("stream cancelled: {0}")]
    Cancelled(String),

    /// The engine task settling this operation went away before settling it.
    /// Surfaces instead of hanging when a hook panics and unwinds its task.
    #[error("stream engine task stopped before the operation settled")]
    Detached,
}

/// Result type alias for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
