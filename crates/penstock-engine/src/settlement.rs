//! Per-operation asynchronous results.
//!
//! `write()`, `close()`, and `abort()` validate and enqueue synchronously,
//! then hand back a [`Settlement`]: a future that resolves once the engine
//! has actually carried the operation out (or rejects it). A settlement is
//! either decided at creation time (validation failures, idempotent results
//! against an already-terminal stream) or backed by a oneshot receiver that
//! the engine's drain task fires later.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use penstock_core::{Result, StreamError};

/// Asynchronous outcome of a single stream operation.
///
/// Dropping a settlement abandons observation of the outcome without
/// affecting the operation itself; a write stays queued and is still
/// delivered to the sink.
#[must_use = "settlements report the operation's outcome and do nothing unless awaited"]
#[derive(Debug)]
pub struct Settlement {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    /// Outcome known at creation time.
    Ready(Option<Result<()>>),
    /// Outcome delivered later by the engine.
    Pending(oneshot::Receiver<Result<()>>),
}

impl Settlement {
    /// Settlement decided at creation time.
    pub(crate) fn now(result: Result<()>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    /// Settlement fired later through the paired sender.
    pub(crate) fn deferred(receiver: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            inner: Inner::Pending(receiver),
        }
    }
}

impl Future for Settlement {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(StreamError::Detached))),
            Inner::Pending(receiver) => Pin::new(receiver).poll(cx).map(|received| {
                // A dropped sender means the engine task unwound (a hook
                // panicked) before settling; surface that instead of hanging.
                received.unwrap_or(Err(StreamError::Detached))
            }),
        }
    }
}
