//! Readable streams: a pull-driven buffer between a [`Source`] and one
//! exclusive reader.
//!
//! The stream never pulls speculatively. A pull is scheduled when a read
//! request finds the buffer empty, when a read drains the last buffered
//! chunk, or when a delivered chunk leaves further requests waiting; at most
//! one pull hook is in flight, and a pull wanted while one is running is
//! remembered and issued once the current one settles.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

use penstock_core::{CountQueuingStrategy, QueuingStrategy, Result, SizeQueue, StreamError};

use crate::controller::ReadableStreamController;
use crate::reader::ReadableStreamReader;
use crate::source::Source;

/// Externally observable state of a [`ReadableStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    /// Chunks may still arrive.
    Readable,
    /// Drained to a clean end of data.
    Closed,
    /// A failure stuck to the stream; all operations are rejected.
    Errored,
}

impl fmt::Display for ReadableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadableState::Readable => write!(f, "readable"),
            ReadableState::Closed => write!(f, "closed"),
            ReadableState::Errored => write!(f, "errored"),
        }
    }
}

pub(crate) enum RState {
    Readable,
    Closed,
    Errored(StreamError),
}

impl RState {
    pub(crate) fn as_public(&self) -> ReadableState {
        match self {
            RState::Readable => ReadableState::Readable,
            RState::Closed => ReadableState::Closed,
            RState::Errored(_) => ReadableState::Errored,
        }
    }
}

/// One waiting `read()` call. Requests are served strictly in arrival order.
pub(crate) type ReadRequest<T> = oneshot::Sender<Result<Option<T>>>;

pub(crate) struct ReadableInner<T> {
    pub(crate) state: RState,
    pub(crate) queue: SizeQueue<T>,
    /// The source announced end of data; the state flips to Closed once the
    /// buffered chunks are drained.
    pub(crate) close_requested: bool,
    pub(crate) started: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_requested: bool,
    pub(crate) read_requests: VecDeque<ReadRequest<T>>,
    pub(crate) reader: Option<Arc<ReaderShared>>,
}

pub(crate) struct ReadableShared<T: Send> {
    pub(crate) inner: Mutex<ReadableInner<T>>,
    // Serializes source hooks.
    pub(crate) source: AsyncMutex<Box<dyn Source<T>>>,
    pub(crate) strategy: Box<dyn QueuingStrategy<T>>,
}

impl<T: Send> ReadableShared<T> {
    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ReadableInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lifetime record shared between a reader handle and the stream.
///
/// Settles exactly once: with `Ok` when the stream closes or the lock is
/// released cleanly, with `Err` when the stream errors. The stream's slot
/// and the reader handle may race to settle it; the first one wins.
pub(crate) struct ReaderShared {
    lifetime: Mutex<ReaderLifetime>,
}

struct ReaderLifetime {
    phase: ReaderPhase,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

enum ReaderPhase {
    /// Holding the lock on a live stream.
    Active,
    /// The stream reached its end state while this reader held the lock.
    Settled(Result<()>),
    /// The lock was given back before the stream settled.
    Released,
}

/// Snapshot of a [`ReaderShared`] phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReaderStatus {
    Active,
    Settled(Result<()>),
    Released,
}

impl ReaderShared {
    pub(crate) fn active() -> Arc<Self> {
        Arc::new(Self {
            lifetime: Mutex::new(ReaderLifetime {
                phase: ReaderPhase::Active,
                waiters: Vec::new(),
            }),
        })
    }

    /// A reader born against an already settled stream.
    pub(crate) fn settled(outcome: Result<()>) -> Arc<Self> {
        Arc::new(Self {
            lifetime: Mutex::new(ReaderLifetime {
                phase: ReaderPhase::Settled(outcome),
                waiters: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReaderLifetime> {
        self.lifetime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn status(&self) -> ReaderStatus {
        match &self.lock().phase {
            ReaderPhase::Active => ReaderStatus::Active,
            ReaderPhase::Settled(outcome) => ReaderStatus::Settled(outcome.clone()),
            ReaderPhase::Released => ReaderStatus::Released,
        }
    }

    /// Stream side: record the stream's outcome. First caller wins.
    pub(crate) fn settle(&self, outcome: Result<()>) {
        let waiters = {
            let mut lifetime = self.lock();
            if !matches!(lifetime.phase, ReaderPhase::Active) {
                return;
            }
            lifetime.phase = ReaderPhase::Settled(outcome.clone());
            mem::take(&mut lifetime.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Reader side: the lock was given back. Anyone waiting on `closed`
    /// learns the reader detached without the stream settling.
    pub(crate) fn release(&self) {
        let waiters = {
            let mut lifetime = self.lock();
            if !matches!(lifetime.phase, ReaderPhase::Active) {
                return;
            }
            lifetime.phase = ReaderPhase::Released;
            mem::take(&mut lifetime.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(StreamError::Detached));
        }
    }

    pub(crate) async fn wait_done(&self) -> Result<()> {
        let settled = {
            let mut lifetime = self.lock();
            match &lifetime.phase {
                ReaderPhase::Settled(outcome) => return outcome.clone(),
                ReaderPhase::Released => return Err(StreamError::Detached),
                ReaderPhase::Active => {
                    // Waiters whose futures were dropped would otherwise
                    // pile up across repeated polls.
                    lifetime.waiters.retain(|waiter| !waiter.is_closed());
                    let (tx, rx) = oneshot::channel();
                    lifetime.waiters.push(tx);
                    rx
                }
            }
        };
        settled.await.unwrap_or(Err(StreamError::Detached))
    }
}

/// Sends deferred past the state lock. Transitions collect their
/// notifications here and fire them after unlocking, so no waker runs with
/// the lock held.
pub(crate) struct ReadEffects<T> {
    requests: Vec<(ReadRequest<T>, Result<Option<T>>)>,
    reader: Option<(Arc<ReaderShared>, Result<()>)>,
    pull: bool,
}

impl<T> ReadEffects<T> {
    pub(crate) fn new() -> Self {
        Self {
            requests: Vec::new(),
            reader: None,
            pull: false,
        }
    }

    pub(crate) fn send(&mut self, request: ReadRequest<T>, outcome: Result<Option<T>>) {
        self.requests.push((request, outcome));
    }

    pub(crate) fn settle_reader(&mut self, reader: Arc<ReaderShared>, outcome: Result<()>) {
        self.reader = Some((reader, outcome));
    }

    pub(crate) fn request_pull(&mut self) {
        self.pull = true;
    }
}

impl<T: Send + 'static> ReadEffects<T> {
    pub(crate) fn fire(self, shared: &Arc<ReadableShared<T>>) {
        for (request, outcome) in self.requests {
            let _ = request.send(outcome);
        }
        if let Some((reader, outcome)) = self.reader {
            reader.settle(outcome);
        }
        if self.pull {
            request_pull(shared);
        }
    }
}

/// Flip to Closed and flush everyone waiting. Callers have already checked
/// that the buffer is drained.
pub(crate) fn finalize_close_locked<T>(
    inner: &mut ReadableInner<T>,
    effects: &mut ReadEffects<T>,
) {
    inner.state = RState::Closed;
    while let Some(request) = inner.read_requests.pop_front() {
        effects.send(request, Ok(None));
    }
    if let Some(reader) = inner.reader.take() {
        effects.settle_reader(reader, Ok(()));
    }
}

/// Flip to Errored, discard the buffer, and reject everyone waiting.
pub(crate) fn error_locked<T>(
    inner: &mut ReadableInner<T>,
    error: StreamError,
    effects: &mut ReadEffects<T>,
) {
    inner.queue.clear();
    inner.state = RState::Errored(error.clone());
    while let Some(request) = inner.read_requests.pop_front() {
        effects.send(request, Err(error.clone()));
    }
    if let Some(reader) = inner.reader.take() {
        effects.settle_reader(reader, Err(error));
    }
}

/// Schedule a pull, or remember that one is wanted if the source has not
/// started yet or a pull is already in flight.
pub(crate) fn request_pull<T: Send + 'static>(shared: &Arc<ReadableShared<T>>) {
    let mut inner = shared.lock_inner();
    if !matches!(inner.state, RState::Readable) || inner.close_requested {
        return;
    }
    if !inner.started || inner.pulling {
        inner.pull_requested = true;
        return;
    }
    inner.pulling = true;
    inner.pull_requested = false;
    drop(inner);
    tokio::spawn(pull_driver(shared.clone()));
}

async fn pull_driver<T: Send + 'static>(shared: Arc<ReadableShared<T>>) {
    let controller = ReadableStreamController::new(&shared);
    loop {
        let pulled = {
            let mut source = shared.source.lock().await;
            source.pull(&controller).await
        };

        if let Err(error) = pulled {
            debug!(%error, "source pull hook failed");
            let mut effects = ReadEffects::new();
            {
                let mut inner = shared.lock_inner();
                inner.pulling = false;
                inner.pull_requested = false;
                if matches!(inner.state, RState::Readable) {
                    error_locked(&mut inner, error, &mut effects);
                }
            }
            effects.fire(&shared);
            return;
        }

        let again = {
            let mut inner = shared.lock_inner();
            if inner.pull_requested
                && matches!(inner.state, RState::Readable)
                && !inner.close_requested
            {
                inner.pull_requested = false;
                true
            } else {
                inner.pulling = false;
                inner.pull_requested = false;
                false
            }
        };
        if !again {
            return;
        }
    }
}

/// Shared teardown for [`ReadableStream::cancel`] and reader cancellation.
/// The buffer is discarded and the state settles synchronously; the source's
/// cancel hook runs after, and its outcome is the outcome of the call.
pub(crate) async fn cancel_inner<T: Send + 'static>(
    shared: &Arc<ReadableShared<T>>,
    reason: StreamError,
    enforce_unlocked: bool,
) -> Result<()> {
    let mut effects = ReadEffects::new();
    {
        let mut inner = shared.lock_inner();
        match &inner.state {
            RState::Closed => return Ok(()),
            RState::Errored(error) => return Err(error.clone()),
            RState::Readable => {}
        }
        if enforce_unlocked && inner.reader.is_some() {
            return Err(StreamError::AlreadyLocked);
        }
        inner.queue.clear();
        inner.close_requested = true;
        finalize_close_locked(&mut inner, &mut effects);
    }
    effects.fire(shared);
    debug!(%reason, "readable stream cancelled");

    let mut source = shared.source.lock().await;
    source.cancel(&reason).await
}

/// Handle for a pull-driven stream of chunks produced by a [`Source`].
///
/// Chunks are consumed through an exclusive [`ReadableStreamReader`]
/// acquired with [`get_reader`](Self::get_reader); the stream itself only
/// exposes lifecycle operations.
pub struct ReadableStream<T: Send> {
    shared: Arc<ReadableShared<T>>,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Create a stream that counts every chunk as size 1, with a high water
    /// mark of 1.
    pub fn new(source: impl Source<T> + 'static) -> Self {
        Self::with_strategy(source, CountQueuingStrategy::new(1))
    }

    /// Create a stream with an explicit queuing strategy.
    pub fn with_strategy(
        source: impl Source<T> + 'static,
        strategy: impl QueuingStrategy<T> + 'static,
    ) -> Self {
        let shared = Arc::new(ReadableShared {
            inner: Mutex::new(ReadableInner {
                state: RState::Readable,
                queue: SizeQueue::new(),
                close_requested: false,
                started: false,
                pulling: false,
                pull_requested: false,
                read_requests: VecDeque::new(),
                reader: None,
            }),
            source: AsyncMutex::new(Box::new(source)),
            strategy: Box::new(strategy),
        });

        let task = shared.clone();
        tokio::spawn(async move {
            let controller = ReadableStreamController::new(&task);
            let started = {
                let mut source = task.source.lock().await;
                source.start(&controller).await
            };
            match started {
                Ok(()) => {
                    let pull_wanted = {
                        let mut inner = task.lock_inner();
                        inner.started = true;
                        inner.pull_requested
                    };
                    if pull_wanted {
                        request_pull(&task);
                    }
                }
                Err(error) => {
                    debug!(%error, "source start hook failed");
                    let mut effects = ReadEffects::new();
                    {
                        let mut inner = task.lock_inner();
                        if matches!(inner.state, RState::Readable) {
                            error_locked(&mut inner, error, &mut effects);
                        }
                    }
                    effects.fire(&task);
                }
            }
        });

        Self { shared }
    }

    /// Acquire the stream's exclusive reader.
    ///
    /// Fails with [`StreamError::AlreadyLocked`] while another reader holds
    /// the lock. Acquiring a reader on an already closed or errored stream
    /// succeeds and yields a reader whose `read` and `closed` report that
    /// outcome immediately.
    pub fn get_reader(&self) -> Result<ReadableStreamReader<T>> {
        let mut inner = self.shared.lock_inner();
        if inner.reader.is_some() {
            return Err(StreamError::AlreadyLocked);
        }
        let lifetime = match &inner.state {
            RState::Readable => {
                let lifetime = ReaderShared::active();
                inner.reader = Some(lifetime.clone());
                lifetime
            }
            RState::Closed => ReaderShared::settled(Ok(())),
            RState::Errored(error) => ReaderShared::settled(Err(error.clone())),
        };
        drop(inner);
        Ok(ReadableStreamReader::new(self.shared.clone(), lifetime))
    }

    /// Discard buffered chunks and shut the source down.
    ///
    /// Rejects with [`StreamError::AlreadyLocked`] while a reader holds the
    /// lock; the reader's own [`cancel`](ReadableStreamReader::cancel) is
    /// the path in that case. Idempotent once the stream has settled:
    /// cancelling a closed stream succeeds, cancelling an errored one
    /// rejects with the stored error.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<()> {
        cancel_inner(&self.shared, StreamError::Cancelled(reason.into()), true).await
    }

    /// `true` while a reader holds the exclusive lock.
    pub fn locked(&self) -> bool {
        self.shared.lock_inner().reader.is_some()
    }

    /// Current state snapshot.
    pub fn state(&self) -> ReadableState {
        self.shared.lock_inner().state.as_public()
    }

    /// Total strategy-measured size currently buffered.
    pub fn queued_size(&self) -> u64 {
        self.shared.lock_inner().queue.total_size()
    }
}

impl<T: Send> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock_inner();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state.as_public())
            .field("locked", &inner.reader.is_some())
            .finish()
    }
}
