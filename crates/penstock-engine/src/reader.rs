//! The exclusive reader: the only way chunks leave a readable stream.

use std::fmt;
use std::mem;
use std::sync::Arc;

use tokio::sync::oneshot;

use penstock_core::{Result, StreamError};

use crate::readable::{
    cancel_inner, finalize_close_locked, request_pull, RState, ReadEffects, ReadableShared,
    ReaderShared, ReaderStatus,
};

/// Exclusive consumer handle for a [`ReadableStream`].
///
/// Holding a reader locks the stream: no second reader can be acquired and
/// the stream's own `cancel` is refused until the lock is given back with
/// [`release_lock`] or by dropping the reader. Dropping the reader while the
/// stream is still live releases the lock without cancelling, so another
/// reader can pick up where this one left off.
///
/// [`ReadableStream`]: crate::readable::ReadableStream
/// [`release_lock`]: Self::release_lock
pub struct ReadableStreamReader<T: Send> {
    shared: Arc<ReadableShared<T>>,
    lifetime: Arc<ReaderShared>,
}

impl<T: Send> ReadableStreamReader<T> {
    pub(crate) fn new(shared: Arc<ReadableShared<T>>, lifetime: Arc<ReaderShared>) -> Self {
        Self { shared, lifetime }
    }
}

impl<T: Send + 'static> ReadableStreamReader<T> {
    /// Take the next chunk, waiting for one if the buffer is empty.
    ///
    /// Returns `Ok(Some(chunk))` for data and `Ok(None)` once the stream
    /// has cleanly ended; an errored stream rejects with the stored error,
    /// and a released reader with [`StreamError::Detached`]. Concurrent
    /// reads queue up and are served strictly in call order.
    pub async fn read(&self) -> Result<Option<T>> {
        match self.lifetime.status() {
            ReaderStatus::Settled(Ok(())) => return Ok(None),
            ReaderStatus::Settled(Err(error)) => return Err(error),
            ReaderStatus::Released => return Err(StreamError::Detached),
            ReaderStatus::Active => {}
        }

        let request = {
            let mut effects = ReadEffects::new();
            let mut inner = self.shared.lock_inner();
            match &inner.state {
                RState::Errored(error) => return Err(error.clone()),
                RState::Closed => return Ok(None),
                RState::Readable => {}
            }
            if let Some(chunk) = inner.queue.dequeue() {
                if inner.queue.is_empty() {
                    if inner.close_requested {
                        finalize_close_locked(&mut inner, &mut effects);
                    } else {
                        // The buffer just ran dry; ask for more before the
                        // next read has to park for it.
                        effects.request_pull();
                    }
                }
                drop(inner);
                effects.fire(&self.shared);
                return Ok(Some(chunk));
            }
            let (tx, rx) = oneshot::channel();
            inner.read_requests.push_back(tx);
            rx
        };

        request_pull(&self.shared);
        request.await.unwrap_or(Err(StreamError::Detached))
    }

    /// Cancel the stream through the lock.
    ///
    /// Same teardown as [`ReadableStream::cancel`], but allowed while this
    /// reader holds the lock. Reads waiting for data resolve as a clean end.
    ///
    /// [`ReadableStream::cancel`]: crate::readable::ReadableStream::cancel
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<()> {
        match self.lifetime.status() {
            ReaderStatus::Settled(Ok(())) => Ok(()),
            ReaderStatus::Settled(Err(error)) => Err(error),
            ReaderStatus::Released => Err(StreamError::Detached),
            ReaderStatus::Active => {
                cancel_inner(&self.shared, StreamError::Cancelled(reason.into()), false).await
            }
        }
    }

    /// Give the lock back without touching the stream.
    ///
    /// Fails with [`StreamError::PendingReads`] while reads are still
    /// waiting for data; reads that were abandoned before data arrived do
    /// not count. No-op once the stream has settled or the lock was already
    /// released.
    pub fn release_lock(&self) -> Result<()> {
        if !matches!(self.lifetime.status(), ReaderStatus::Active) {
            return Ok(());
        }
        {
            let mut inner = self.shared.lock_inner();
            inner.read_requests.retain(|request| !request.is_closed());
            if !inner.read_requests.is_empty() {
                return Err(StreamError::PendingReads);
            }
            if let Some(slot) = &inner.reader {
                if Arc::ptr_eq(slot, &self.lifetime) {
                    inner.reader = None;
                }
            }
        }
        self.lifetime.release();
        Ok(())
    }

    /// Wait for the stream, as seen through this lock, to settle.
    ///
    /// Resolves `Ok` on a clean close, rejects with the stored error if the
    /// stream errors, and rejects with [`StreamError::Detached`] if the
    /// lock is released first.
    pub async fn closed(&self) -> Result<()> {
        self.lifetime.wait_done().await
    }
}

impl<T: Send> Drop for ReadableStreamReader<T> {
    fn drop(&mut self) {
        if !matches!(self.lifetime.status(), ReaderStatus::Active) {
            return;
        }
        {
            let mut inner = self.shared.lock_inner();
            if let Some(slot) = &inner.reader {
                if Arc::ptr_eq(slot, &self.lifetime) {
                    inner.reader = None;
                }
            }
            // No read can be in flight here (reads borrow the reader), so
            // whatever is queued belongs to abandoned futures.
            mem::take(&mut inner.read_requests)
        };
        self.lifetime.release();
    }
}

impl<T: Send> fmt::Debug for ReadableStreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadableStreamReader")
    }
}
