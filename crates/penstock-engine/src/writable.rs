//! Writable streams: a sized write queue drained into a [`Sink`] by a
//! background task.
//!
//! [`WritableStream::write`] never blocks the caller. Chunks are accepted
//! into the queue immediately and handed to the sink one at a time, in
//! order, by the drain task. Backpressure is advisory: when the queued bytes
//! (as measured by the stream's [`QueuingStrategy`]) exceed the high water
//! mark the stream moves to [`WritableState::Waiting`] and [`ready`] stalls,
//! but writes submitted anyway are still queued.
//!
//! [`ready`]: WritableStream::ready

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::debug;

use penstock_core::{CountQueuingStrategy, QueuingStrategy, Result, SizeQueue, StreamError};

use crate::settlement::Settlement;
use crate::sink::{ErrorSignal, Sink};

/// Externally observable state of a [`WritableStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    /// Accepting writes, no pressure.
    Writable,
    /// Accepting writes, but the queue is over the high water mark.
    Waiting,
    /// Close requested; queued writes are still draining.
    Closing,
    /// The sink's close hook completed.
    Closed,
    /// A failure stuck to the stream; all operations are rejected.
    Errored,
}

impl fmt::Display for WritableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WritableState::Writable => write!(f, "writable"),
            WritableState::Waiting => write!(f, "waiting"),
            WritableState::Closing => write!(f, "closing"),
            WritableState::Closed => write!(f, "closed"),
            WritableState::Errored => write!(f, "errored"),
        }
    }
}

enum WState {
    Writable,
    Waiting,
    Closing,
    Closed,
    Errored(StreamError),
}

impl WState {
    fn as_public(&self) -> WritableState {
        match self {
            WState::Writable => WritableState::Writable,
            WState::Waiting => WritableState::Waiting,
            WState::Closing => WritableState::Closing,
            WState::Closed => WritableState::Closed,
            WState::Errored(_) => WritableState::Errored,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, WState::Closed | WState::Errored(_))
    }
}

enum QueuedWrite<T> {
    Chunk {
        // The drain loop takes the chunk out while the sink call is in
        // flight; the hollowed record stays queued so its size still counts
        // toward backpressure until the sink accepts it.
        chunk: Option<T>,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    CloseSentinel,
}

type Waiter = oneshot::Sender<Result<()>>;

struct WritableInner<T> {
    state: WState,
    queue: SizeQueue<QueuedWrite<T>>,
    ready_waiters: Vec<Waiter>,
    closed_waiters: Vec<Waiter>,
}

struct Shared<T: Send> {
    inner: Mutex<WritableInner<T>>,
    // Serializes sink hooks: the drain task and the abort teardown task
    // both go through this lock, so at most one hook runs at a time.
    sink: AsyncMutex<Box<dyn Sink<T>>>,
    strategy: Box<dyn QueuingStrategy<T>>,
}

impl<T: Send> Shared<T> {
    fn lock_inner(&self) -> MutexGuard<'_, WritableInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle for submitting chunks to a [`Sink`].
///
/// Created with [`WritableStream::new`] or [`WritableStream::with_strategy`].
/// Dropping the handle without closing abandons the stream: the drain task
/// finishes the writes already queued and exits without invoking the sink's
/// close hook.
pub struct WritableStream<T: Send> {
    shared: Arc<Shared<T>>,
    kick: mpsc::UnboundedSender<()>,
}

impl<T: Send + 'static> WritableStream<T> {
    /// Create a stream that counts every chunk as size 1, with a high water
    /// mark of 1.
    pub fn new(sink: impl Sink<T> + 'static) -> Self {
        Self::with_strategy(sink, CountQueuingStrategy::new(1))
    }

    /// Create a stream with an explicit queuing strategy.
    pub fn with_strategy(
        sink: impl Sink<T> + 'static,
        strategy: impl QueuingStrategy<T> + 'static,
    ) -> Self {
        let (kick, kick_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(WritableInner {
                state: WState::Writable,
                queue: SizeQueue::new(),
                ready_waiters: Vec::new(),
                closed_waiters: Vec::new(),
            }),
            sink: AsyncMutex::new(Box::new(sink)),
            strategy: Box::new(strategy),
        });
        tokio::spawn(drain_loop(shared.clone(), kick_rx));
        Self { shared, kick }
    }

    /// Submit one chunk.
    ///
    /// The chunk is queued synchronously; the returned [`Settlement`]
    /// resolves once the sink's write hook has accepted it, and rejects if
    /// the stream errors first. Writes against a closing, closed, or errored
    /// stream reject immediately without touching the queue.
    pub fn write(&self, chunk: T) -> Settlement {
        // User-supplied sizing runs outside the state lock.
        let sized = self.shared.strategy.size(&chunk);

        let mut inner = self.shared.lock_inner();
        match &inner.state {
            WState::Closed => return Settlement::now(Err(StreamError::Closed)),
            WState::Closing => return Settlement::now(Err(StreamError::Closing)),
            WState::Errored(error) => return Settlement::now(Err(error.clone())),
            WState::Writable | WState::Waiting => {}
        }

        let size = match sized {
            Ok(size) => size,
            Err(error) => {
                // A failing size function poisons the whole stream, not
                // just this write.
                let waiters = error_locked(&mut inner, error.clone());
                drop(inner);
                debug!(%error, "queuing strategy rejected chunk");
                settle_all(waiters, &Err(error.clone()));
                let _ = self.kick.send(());
                return Settlement::now(Err(error));
            }
        };

        let (ack, settled) = oneshot::channel();
        inner.queue.enqueue(
            QueuedWrite::Chunk {
                chunk: Some(chunk),
                ack: Some(ack),
            },
            size,
        );
        let released = sync_backpressure(&mut inner, self.shared.strategy.high_water_mark());
        drop(inner);

        settle_all(released, &Ok(()));
        let _ = self.kick.send(());
        Settlement::deferred(settled)
    }

    /// Request an orderly shutdown.
    ///
    /// Writes submitted before the close are still delivered; once the queue
    /// drains, the sink's close hook runs and the stream becomes
    /// [`WritableState::Closed`]. The returned [`Settlement`] resolves when
    /// that happens. Closing also releases anyone parked on [`ready`],
    /// since waiting out backpressure on a closing stream is pointless.
    ///
    /// [`ready`]: Self::ready
    pub fn close(&self) -> Settlement {
        let mut inner = self.shared.lock_inner();
        match &inner.state {
            WState::Closed => return Settlement::now(Err(StreamError::Closed)),
            WState::Closing => return Settlement::now(Err(StreamError::Closing)),
            WState::Errored(error) => return Settlement::now(Err(error.clone())),
            WState::Writable | WState::Waiting => {}
        }

        inner.state = WState::Closing;
        inner.queue.enqueue(QueuedWrite::CloseSentinel, 0);
        let ready = mem::take(&mut inner.ready_waiters);
        let (tx, settled) = oneshot::channel();
        inner.closed_waiters.push(tx);
        drop(inner);

        debug!("writable stream closing");
        settle_all(ready, &Ok(()));
        let _ = self.kick.send(());
        Settlement::deferred(settled)
    }

    /// Abandon the stream immediately.
    ///
    /// Queued and in-flight writes reject with the abort reason, the state
    /// flips to errored synchronously, and the sink's abort hook runs in the
    /// background (after any hook already in flight finishes). The returned
    /// [`Settlement`] reports the abort hook's outcome. Aborting an already
    /// closed stream is a no-op; aborting an errored stream rejects with the
    /// stored error.
    pub fn abort(&self, reason: impl Into<String>) -> Settlement {
        let reason = StreamError::Aborted(reason.into());

        let mut inner = self.shared.lock_inner();
        match &inner.state {
            WState::Closed => return Settlement::now(Ok(())),
            WState::Errored(error) => return Settlement::now(Err(error.clone())),
            WState::Writable | WState::Waiting | WState::Closing => {}
        }

        let waiters = error_locked(&mut inner, reason.clone());
        drop(inner);

        debug!(%reason, "writable stream aborted");
        settle_all(waiters, &Err(reason.clone()));
        let _ = self.kick.send(());

        let shared = self.shared.clone();
        let (tx, settled) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = {
                let mut sink = shared.sink.lock().await;
                sink.abort(&reason).await
            };
            let _ = tx.send(outcome);
        });
        Settlement::deferred(settled)
    }

    /// Wait until the stream is no longer applying backpressure.
    ///
    /// Resolves immediately unless the stream is in
    /// [`WritableState::Waiting`]; rejects with the stored error if the
    /// stream errors while parked.
    pub async fn ready(&self) -> Result<()> {
        let settled = {
            let mut inner = self.shared.lock_inner();
            match &inner.state {
                WState::Waiting => {
                    inner.ready_waiters.retain(|waiter| !waiter.is_closed());
                    let (tx, rx) = oneshot::channel();
                    inner.ready_waiters.push(tx);
                    rx
                }
                WState::Errored(error) => return Err(error.clone()),
                WState::Writable | WState::Closing | WState::Closed => return Ok(()),
            }
        };
        settled.await.unwrap_or(Err(StreamError::Detached))
    }

    /// Wait for the stream's terminal state: resolves once closed, rejects
    /// with the stored error once errored.
    pub async fn closed(&self) -> Result<()> {
        let settled = {
            let mut inner = self.shared.lock_inner();
            match &inner.state {
                WState::Closed => return Ok(()),
                WState::Errored(error) => return Err(error.clone()),
                WState::Writable | WState::Waiting | WState::Closing => {
                    inner.closed_waiters.retain(|waiter| !waiter.is_closed());
                    let (tx, rx) = oneshot::channel();
                    inner.closed_waiters.push(tx);
                    rx
                }
            }
        };
        settled.await.unwrap_or(Err(StreamError::Detached))
    }

    /// Current state snapshot.
    pub fn state(&self) -> WritableState {
        self.shared.lock_inner().state.as_public()
    }

    /// Total strategy-measured size currently queued, in-flight chunk
    /// included.
    pub fn queued_size(&self) -> u64 {
        self.shared.lock_inner().queue.total_size()
    }
}

impl<T: Send> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStream")
            .field("state", &self.shared.lock_inner().state.as_public())
            .finish()
    }
}

/// Move the stream to errored, rejecting everything that was pending.
/// Returns the senders to settle once the lock is released.
fn error_locked<T>(inner: &mut WritableInner<T>, error: StreamError) -> Vec<Waiter> {
    let mut waiters = Vec::new();
    while let Some(record) = inner.queue.dequeue() {
        if let QueuedWrite::Chunk { ack: Some(ack), .. } = record {
            waiters.push(ack);
        }
    }
    waiters.append(&mut inner.ready_waiters);
    waiters.append(&mut inner.closed_waiters);
    inner.state = WState::Errored(error);
    waiters
}

/// Re-derive Writable/Waiting from the queue total. Pressure applies
/// strictly above the mark and lifts strictly below it; sitting exactly at
/// the mark keeps the current state. Returns the ready waiters released by
/// a Waiting -> Writable transition.
fn sync_backpressure<T>(inner: &mut WritableInner<T>, high_water_mark: u64) -> Vec<Waiter> {
    let total = inner.queue.total_size();
    match inner.state {
        WState::Writable if total > high_water_mark => {
            inner.state = WState::Waiting;
            Vec::new()
        }
        WState::Waiting if total < high_water_mark => {
            inner.state = WState::Writable;
            mem::take(&mut inner.ready_waiters)
        }
        _ => Vec::new(),
    }
}

fn settle_all(waiters: Vec<Waiter>, result: &Result<()>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

fn error_signal<T: Send + 'static>(shared: &Arc<Shared<T>>) -> ErrorSignal {
    let weak = Arc::downgrade(shared);
    ErrorSignal::new(move |error| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let waiters = {
            let mut inner = shared.lock_inner();
            if inner.state.is_terminal() {
                Vec::new()
            } else {
                error_locked(&mut inner, error.clone())
            }
        };
        debug!(%error, "sink raised an out-of-band error");
        settle_all(waiters, &Err(error));
    })
}

enum Step<T> {
    Park,
    Exit,
    Write(T),
    Close,
}

/// Background task that feeds the sink from the queue, one hook at a time.
async fn drain_loop<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    mut kick: mpsc::UnboundedReceiver<()>,
) {
    let started = {
        let errors = error_signal(&shared);
        let mut sink = shared.sink.lock().await;
        sink.start(errors).await
    };
    if let Err(error) = started {
        debug!(%error, "sink start hook failed");
        let waiters = {
            let mut inner = shared.lock_inner();
            if inner.state.is_terminal() {
                Vec::new()
            } else {
                error_locked(&mut inner, error.clone())
            }
        };
        settle_all(waiters, &Err(error));
        return;
    }

    let mut handle_alive = true;
    loop {
        let step = {
            let mut inner = shared.lock_inner();
            if inner.state.is_terminal() {
                Step::Exit
            } else {
                match inner.queue.peek_mut() {
                    None => {
                        if handle_alive {
                            Step::Park
                        } else {
                            Step::Exit
                        }
                    }
                    Some(QueuedWrite::Chunk { chunk, .. }) => match chunk.take() {
                        Some(chunk) => Step::Write(chunk),
                        // Only this loop hollows the front record, and it
                        // dequeues the record before looping.
                        None => Step::Park,
                    },
                    Some(QueuedWrite::CloseSentinel) => Step::Close,
                }
            }
        };

        match step {
            Step::Park => {
                if kick.recv().await.is_none() {
                    handle_alive = false;
                }
            }
            Step::Exit => break,
            Step::Write(chunk) => {
                let written = {
                    let mut sink = shared.sink.lock().await;
                    sink.write(chunk).await
                };
                match written {
                    Ok(()) => {
                        let (ack, released) = {
                            let mut inner = shared.lock_inner();
                            if inner.state.is_terminal() {
                                // An abort raced the write; its error path
                                // already settled the queue.
                                (None, Vec::new())
                            } else {
                                let ack = match inner.queue.dequeue() {
                                    Some(QueuedWrite::Chunk { ack, .. }) => ack,
                                    _ => None,
                                };
                                let released = sync_backpressure(
                                    &mut inner,
                                    shared.strategy.high_water_mark(),
                                );
                                (ack, released)
                            }
                        };
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(()));
                        }
                        settle_all(released, &Ok(()));
                    }
                    Err(error) => {
                        debug!(%error, "sink write hook failed");
                        let waiters = {
                            let mut inner = shared.lock_inner();
                            if inner.state.is_terminal() {
                                Vec::new()
                            } else {
                                error_locked(&mut inner, error.clone())
                            }
                        };
                        settle_all(waiters, &Err(error));
                    }
                }
            }
            Step::Close => {
                let closed = {
                    let mut sink = shared.sink.lock().await;
                    sink.close().await
                };
                match closed {
                    Ok(()) => {
                        let waiters = {
                            let mut inner = shared.lock_inner();
                            if matches!(inner.state, WState::Closing) {
                                inner.queue.dequeue();
                                inner.state = WState::Closed;
                                mem::take(&mut inner.closed_waiters)
                            } else {
                                Vec::new()
                            }
                        };
                        debug!("writable stream closed");
                        settle_all(waiters, &Ok(()));
                    }
                    Err(error) => {
                        debug!(%error, "sink close hook failed");
                        let waiters = {
                            let mut inner = shared.lock_inner();
                            if inner.state.is_terminal() {
                                Vec::new()
                            } else {
                                error_locked(&mut inner, error.clone())
                            }
                        };
                        settle_all(waiters, &Err(error));
                    }
                }
            }
        }
    }
}
