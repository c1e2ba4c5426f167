//! The sink contract: the pluggable consumer side driven by a
//! [`WritableStream`](crate::writable::WritableStream).
//!
//! Every hook is optional: the trait ships default no-op bodies, so an
//! implementation overrides only the lifecycle points it cares about. A sink
//! that overrides nothing silently accepts and discards every chunk. Hooks
//! take `&mut self` and are serialized by the stream; at most one hook is in
//! flight at any time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use penstock_core::{Result, StreamError};

/// Consumer-side hooks invoked by a writable stream.
///
/// Hook failures are never retried: an `Err` from `start`, `write`, or
/// `close` errors the owning stream, and the stored error is re-delivered to
/// every outstanding and future operation. Retry policy belongs inside the
/// sink implementation.
#[async_trait]
pub trait Sink<T: Send + 'static>: Send {
    /// Called once, before any chunk is delivered. The drain loop does not
    /// start feeding chunks until this completes. `errors` lets the sink
    /// fail the stream later, outside any hook invocation.
    async fn start(&mut self, errors: ErrorSignal) -> Result<()> {
        let _ = errors;
        Ok(())
    }

    /// Deliver one chunk. The next chunk is not delivered until the returned
    /// future settles.
    async fn write(&mut self, chunk: T) -> Result<()> {
        drop(chunk);
        Ok(())
    }

    /// Flush and release resources after the final chunk. Invoked by the
    /// drain loop when a requested close reaches the front of the queue.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear down after an abort. The stream has already transitioned to its
    /// errored state when this runs. Defaults to forwarding to [`close`],
    /// so sinks without dedicated abort handling still release resources.
    ///
    /// [`close`]: Self::close
    async fn abort(&mut self, reason: &StreamError) -> Result<()> {
        let _ = reason;
        self.close().await
    }
}

/// Out-of-band failure handle passed to [`Sink::start`].
///
/// Cloneable and detached from the stream's lifetime: raising against a
/// stream that is already terminal, or already dropped, is a no-op. This is
/// how a sink reports failures that happen between hook invocations (a
/// connection dropping while the queue is idle, for example).
#[derive(Clone)]
pub struct ErrorSignal {
    raise: Arc<dyn Fn(StreamError) + Send + Sync>,
}

impl ErrorSignal {
    pub(crate) fn new(raise: impl Fn(StreamError) + Send + Sync + 'static) -> Self {
        Self {
            raise: Arc::new(raise),
        }
    }

    /// Fail the owning stream with `error`.
    pub fn raise(&self, error: StreamError) {
        (self.raise)(error);
    }
}

impl fmt::Debug for ErrorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorSignal")
    }
}
