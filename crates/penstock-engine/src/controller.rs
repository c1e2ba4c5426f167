//! The source's handle into its stream's buffer and state.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::debug;

use penstock_core::{Result, StreamError};

use crate::readable::{
    error_locked, finalize_close_locked, RState, ReadEffects, ReadableShared,
};

/// Handed to every [`Source`](crate::source::Source) hook. Enqueues chunks,
/// announces end of data, and reports failures.
///
/// Holds only a weak reference to the stream, so a source keeping a clone
/// alive does not keep the stream alive; operations on a controller whose
/// stream is gone fail with [`StreamError::Detached`].
pub struct ReadableStreamController<T: Send> {
    shared: Weak<ReadableShared<T>>,
}

impl<T: Send> Clone for ReadableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> ReadableStreamController<T> {
    pub(crate) fn new(shared: &Arc<ReadableShared<T>>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            shared: Weak::new(),
        }
    }

    /// Hand one chunk to the stream.
    ///
    /// Goes straight to the longest-waiting read request if one is parked,
    /// into the buffer otherwise. Fails once the stream has settled or a
    /// close has been requested. A failing size function errors the whole
    /// stream and fails this call with the same error.
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(StreamError::Detached)?;

        // User-supplied sizing runs outside the state lock.
        let sized = shared.strategy.size(&chunk);

        let mut effects = ReadEffects::new();
        let outcome = {
            let mut inner = shared.lock_inner();
            match &inner.state {
                RState::Errored(error) => Err(error.clone()),
                RState::Closed => Err(StreamError::Closed),
                RState::Readable if inner.close_requested => Err(StreamError::CloseRequested),
                RState::Readable => match sized {
                    Err(error) => {
                        debug!(%error, "queuing strategy rejected chunk");
                        error_locked(&mut inner, error.clone(), &mut effects);
                        Err(error)
                    }
                    Ok(size) => {
                        let mut unclaimed = Some(chunk);
                        while let Some(chunk) = unclaimed.take() {
                            let Some(request) = inner.read_requests.pop_front() else {
                                unclaimed = Some(chunk);
                                break;
                            };
                            match request.send(Ok(Some(chunk))) {
                                Ok(()) => break,
                                // The read future was dropped before data
                                // arrived; reclaim the chunk for the next
                                // request in line.
                                Err(returned) => {
                                    if let Ok(Some(chunk)) = returned {
                                        unclaimed = Some(chunk);
                                    }
                                }
                            }
                        }
                        if let Some(chunk) = unclaimed {
                            inner.queue.enqueue(chunk, size);
                        } else if !inner.read_requests.is_empty() {
                            // More reads are parked than this chunk served.
                            effects.request_pull();
                        }
                        Ok(())
                    }
                },
            }
        };
        effects.fire(&shared);
        outcome
    }

    /// Announce end of data.
    ///
    /// Chunks already buffered are still delivered; the stream flips to
    /// closed once the buffer drains (immediately, if it already has).
    /// Fails once the stream has settled or a close was already requested.
    pub fn close(&self) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(StreamError::Detached)?;
        let mut effects = ReadEffects::new();
        let outcome = {
            let mut inner = shared.lock_inner();
            match &inner.state {
                RState::Errored(error) => Err(error.clone()),
                RState::Closed => Err(StreamError::Closed),
                RState::Readable if inner.close_requested => Err(StreamError::CloseRequested),
                RState::Readable => {
                    inner.close_requested = true;
                    if inner.queue.is_empty() {
                        finalize_close_locked(&mut inner, &mut effects);
                    }
                    Ok(())
                }
            }
        };
        effects.fire(&shared);
        if outcome.is_ok() {
            debug!("source requested close");
        }
        outcome
    }

    /// Fail the stream.
    ///
    /// The buffer is discarded, parked reads reject with `error`, and every
    /// later operation reports it. Fails once the stream has already
    /// settled; a close request that has not yet finalized does not win
    /// against an error.
    pub fn error(&self, error: StreamError) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(StreamError::Detached)?;
        let mut effects = ReadEffects::new();
        let outcome = {
            let mut inner = shared.lock_inner();
            match &inner.state {
                RState::Errored(stored) => Err(stored.clone()),
                RState::Closed => Err(StreamError::Closed),
                RState::Readable => {
                    debug!(%error, "source errored the stream");
                    error_locked(&mut inner, error, &mut effects);
                    Ok(())
                }
            }
        };
        effects.fire(&shared);
        outcome
    }

    /// Remaining capacity before the buffer crosses the high water mark.
    ///
    /// Negative once the buffer is over the mark, `Some(0)` after the
    /// stream closes, `None` once it errors or its handles are gone.
    pub fn desired_size(&self) -> Option<i64> {
        let shared = self.shared.upgrade()?;
        let inner = shared.lock_inner();
        match &inner.state {
            RState::Readable => {
                let mark = shared.strategy.high_water_mark() as i64;
                let queued = inner.queue.total_size() as i64;
                Some(mark - queued)
            }
            RState::Closed => Some(0),
            RState::Errored(_) => None,
        }
    }
}

impl<T: Send> fmt::Debug for ReadableStreamController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadableStreamController")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::ReadableInner;
    use crate::source::Source;
    use async_trait::async_trait;
    use penstock_core::{CountQueuingStrategy, SizeQueue};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct SilentSource;

    #[async_trait]
    impl Source<u32> for SilentSource {}

    fn bare_shared(high_water_mark: u64) -> Arc<ReadableShared<u32>> {
        Arc::new(ReadableShared {
            inner: Mutex::new(ReadableInner {
                state: RState::Readable,
                queue: SizeQueue::new(),
                close_requested: false,
                started: true,
                pulling: false,
                pull_requested: false,
                read_requests: VecDeque::new(),
                reader: None,
            }),
            source: AsyncMutex::new(Box::new(SilentSource)),
            strategy: Box::new(CountQueuingStrategy::new(high_water_mark)),
        })
    }

    #[test]
    fn test_enqueue_buffers_and_tracks_desired_size() {
        let shared = bare_shared(2);
        let controller = ReadableStreamController::new(&shared);

        assert_eq!(controller.desired_size(), Some(2));
        assert_eq!(controller.enqueue(10), Ok(()));
        assert_eq!(controller.enqueue(20), Ok(()));
        assert_eq!(controller.enqueue(30), Ok(()));
        assert_eq!(controller.desired_size(), Some(-1));
        assert_eq!(shared.lock_inner().queue.len(), 3);
    }

    #[test]
    fn test_enqueue_after_close_request_is_rejected() {
        let shared = bare_shared(1);
        let controller = ReadableStreamController::new(&shared);

        assert_eq!(controller.enqueue(1), Ok(()));
        assert_eq!(controller.close(), Ok(()));
        assert_eq!(controller.enqueue(2), Err(StreamError::CloseRequested));
        assert_eq!(controller.close(), Err(StreamError::CloseRequested));
    }

    #[test]
    fn test_close_on_empty_buffer_finalizes_immediately() {
        let shared = bare_shared(1);
        let controller = ReadableStreamController::new(&shared);

        assert_eq!(controller.close(), Ok(()));
        assert!(matches!(shared.lock_inner().state, RState::Closed));
        assert_eq!(controller.desired_size(), Some(0));
        assert_eq!(controller.enqueue(1), Err(StreamError::Closed));
    }

    #[test]
    fn test_error_discards_buffer_and_sticks() {
        let shared = bare_shared(1);
        let controller = ReadableStreamController::new(&shared);

        assert_eq!(controller.enqueue(1), Ok(()));
        assert_eq!(
            controller.error(StreamError::Source("backend died".to_string())),
            Ok(())
        );
        assert_eq!(controller.desired_size(), None);
        assert_eq!(shared.lock_inner().queue.len(), 0);
        assert_eq!(
            controller.enqueue(2),
            Err(StreamError::Source("backend died".to_string()))
        );
        assert_eq!(
            controller.error(StreamError::Closed),
            Err(StreamError::Source("backend died".to_string()))
        );
    }

    #[test]
    fn test_detached_controller_reports_detached() {
        let controller = ReadableStreamController::<u32>::detached();
        assert_eq!(controller.enqueue(1), Err(StreamError::Detached));
        assert_eq!(controller.close(), Err(StreamError::Detached));
        assert_eq!(controller.error(StreamError::Closed), Err(StreamError::Detached));
        assert_eq!(controller.desired_size(), None);
    }

    #[test]
    fn test_controller_clones_share_the_stream() {
        let shared = bare_shared(1);
        let controller = ReadableStreamController::new(&shared);
        let clone = controller.clone();

        assert_eq!(clone.enqueue(5), Ok(()));
        assert_eq!(controller.desired_size(), Some(0));
        assert_eq!(format!("{:?}", clone), "ReadableStreamController");
    }
}
