//! The source contract: the pluggable producer side driven by a
//! [`ReadableStream`](crate::readable::ReadableStream).
//!
//! A source never pushes on its own schedule. The stream calls [`pull`]
//! when a consumer is waiting, and the source hands chunks over through the
//! [`ReadableStreamController`] it receives. All hooks have default no-op
//! bodies and are serialized by the stream.
//!
//! [`pull`]: Source::pull

use async_trait::async_trait;

use penstock_core::{Result, StreamError};

use crate::controller::ReadableStreamController;

/// Producer-side hooks invoked by a readable stream.
#[async_trait]
pub trait Source<T: Send>: Send {
    /// Called once, before any pull. Pulling does not begin until this
    /// completes. A source that produces eagerly can enqueue its first
    /// chunks here.
    async fn start(&mut self, controller: &ReadableStreamController<T>) -> Result<()> {
        let _ = controller;
        Ok(())
    }

    /// Produce more data. Called only while a consumer is waiting, and never
    /// concurrently with itself: the next pull waits for the previous one to
    /// settle. Enqueue zero or more chunks via `controller`, or signal the
    /// end of data with [`ReadableStreamController::close`].
    async fn pull(&mut self, controller: &ReadableStreamController<T>) -> Result<()> {
        let _ = controller;
        Ok(())
    }

    /// Release resources after the consumer cancels. The stream has already
    /// discarded its buffer and moved to the closed state when this runs.
    async fn cancel(&mut self, reason: &StreamError) -> Result<()> {
        let _ = reason;
        Ok(())
    }
}
