//! Integration tests for piping a readable stream into a writable stream.
//!
//! These tests verify the pump end to end:
//! 1. pipe_to() takes the source's reader lock and moves chunks across
//! 2. Destination backpressure stalls the pump, not the caller
//! 3. End of data closes the destination (unless prevented)
//! 4. A source failure aborts the destination (unless prevented)
//! 5. A destination failure cancels the source (unless prevented)

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use penstock_engine::{
    PipeOptions, ReadableState, ReadableStream, ReadableStreamController, Result, Sink, Source,
    StreamError, WritableState, WritableStream,
};

/// Source that replays a script, one chunk per pull, then closes; records
/// the cancel reason if the pipe tears it down.
struct ScriptedSource {
    chunks: VecDeque<u32>,
    cancelled: Arc<Mutex<Option<String>>>,
}

impl ScriptedSource {
    fn new(chunks: impl IntoIterator<Item = u32>) -> (Self, Arc<Mutex<Option<String>>>) {
        let cancelled = Arc::new(Mutex::new(None));
        let source = Self {
            chunks: chunks.into_iter().collect(),
            cancelled: cancelled.clone(),
        };
        (source, cancelled)
    }
}

#[async_trait]
impl Source<u32> for ScriptedSource {
    async fn pull(&mut self, controller: &ReadableStreamController<u32>) -> Result<()> {
        match self.chunks.pop_front() {
            Some(chunk) => controller.enqueue(chunk),
            None => controller.close(),
        }
    }

    async fn cancel(&mut self, reason: &StreamError) -> Result<()> {
        *self.cancelled.lock().unwrap() = Some(reason.to_string());
        Ok(())
    }
}

/// Sink that accepts everything immediately, logging chunks and lifecycle.
struct RecordingSink {
    chunks: Arc<Mutex<Vec<u32>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    fn new() -> (Self, Arc<Mutex<Vec<u32>>>, Arc<Mutex<Vec<String>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Self {
            chunks: chunks.clone(),
            events: events.clone(),
        };
        (sink, chunks, events)
    }
}

#[async_trait]
impl Sink<u32> for RecordingSink {
    async fn write(&mut self, chunk: u32) -> Result<()> {
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.events.lock().unwrap().push("close".to_string());
        Ok(())
    }

    async fn abort(&mut self, _reason: &StreamError) -> Result<()> {
        self.events.lock().unwrap().push("abort".to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_pipe_moves_every_chunk_then_closes_destination() {
    let (source, cancelled) = ScriptedSource::new(1..=5);
    let source = ReadableStream::new(source);
    let (sink, chunks, events) = RecordingSink::new();
    let dest = WritableStream::new(sink);

    source.pipe_to(&dest).await.unwrap();

    assert_eq!(*chunks.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(*events.lock().unwrap(), vec!["close"]);
    assert_eq!(source.state(), ReadableState::Closed);
    assert_eq!(dest.state(), WritableState::Closed);
    assert!(cancelled.lock().unwrap().is_none());
    // The pump gave the reader lock back
    assert!(!source.locked());
}

/// Sink that blocks each write on a semaphore permit.
struct GatedSink {
    gate: Arc<Semaphore>,
    chunks: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Sink<u32> for GatedSink {
    async fn write(&mut self, chunk: u32) -> Result<()> {
        self.gate.acquire().await.unwrap().forget();
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }
}

#[tokio::test]
async fn test_pipe_stalls_on_destination_pressure() {
    let (source, _cancelled) = ScriptedSource::new(1..=4);
    let source = ReadableStream::new(source);

    let gate = Arc::new(Semaphore::new(0));
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let dest = WritableStream::new(GatedSink {
        gate: gate.clone(),
        chunks: chunks.clone(),
    });

    let pipe = source.pipe_to(&dest);
    tokio::pin!(pipe);

    // With the sink gated and a mark of one chunk, the pump parks after
    // running the destination just past its mark
    assert!(timeout(Duration::from_millis(100), pipe.as_mut())
        .await
        .is_err());
    assert_eq!(dest.state(), WritableState::Waiting);
    assert_eq!(dest.queued_size(), 2);

    gate.add_permits(10);
    timeout(Duration::from_millis(500), pipe)
        .await
        .expect("pipe should finish once the sink drains")
        .unwrap();
    assert_eq!(*chunks.lock().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(dest.state(), WritableState::Closed);
}

#[tokio::test]
async fn test_pipe_prevent_close_leaves_destination_open() {
    let (source, _cancelled) = ScriptedSource::new([1, 2]);
    let source = ReadableStream::new(source);
    let (sink, chunks, events) = RecordingSink::new();
    let dest = WritableStream::new(sink);

    let options = PipeOptions {
        prevent_close: true,
        ..PipeOptions::default()
    };
    source.pipe_to_with(&dest, options).await.unwrap();

    assert_eq!(source.state(), ReadableState::Closed);
    assert_eq!(dest.state(), WritableState::Writable);
    assert!(events.lock().unwrap().is_empty());

    // The destination keeps working for other producers
    dest.write(9).await.unwrap();
    dest.close().await.unwrap();
    assert_eq!(*chunks.lock().unwrap(), vec![1, 2, 9]);
}

/// Source whose pull always fails.
struct FailingSource;

#[async_trait]
impl Source<u32> for FailingSource {
    async fn pull(&mut self, _controller: &ReadableStreamController<u32>) -> Result<()> {
        Err(StreamError::Source("pull exploded".to_string()))
    }
}

#[tokio::test]
async fn test_pipe_aborts_destination_when_source_fails() {
    let source = ReadableStream::new(FailingSource);
    let (sink, chunks, events) = RecordingSink::new();
    let dest = WritableStream::new(sink);

    let outcome = source.pipe_to(&dest).await;
    assert_eq!(
        outcome,
        Err(StreamError::Source("pull exploded".to_string()))
    );
    assert_eq!(dest.state(), WritableState::Errored);
    assert_eq!(*events.lock().unwrap(), vec!["abort"]);
    assert!(chunks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pipe_prevent_abort_leaves_destination_alone() {
    let source = ReadableStream::new(FailingSource);
    let (sink, _chunks, events) = RecordingSink::new();
    let dest = WritableStream::new(sink);

    let options = PipeOptions {
        prevent_abort: true,
        ..PipeOptions::default()
    };
    let outcome = source.pipe_to_with(&dest, options).await;
    assert_eq!(
        outcome,
        Err(StreamError::Source("pull exploded".to_string()))
    );
    assert_eq!(dest.state(), WritableState::Writable);
    assert!(events.lock().unwrap().is_empty());
}

/// Sink that rejects one specific chunk.
struct FailingSink {
    fail_on: u32,
}

#[async_trait]
impl Sink<u32> for FailingSink {
    async fn write(&mut self, chunk: u32) -> Result<()> {
        if chunk == self.fail_on {
            return Err(StreamError::Sink(format!("refused chunk {}", chunk)));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_pipe_cancels_source_when_destination_fails() {
    let (source, cancelled) = ScriptedSource::new(1..=10);
    let source = ReadableStream::new(source);
    let dest = WritableStream::new(FailingSink { fail_on: 1 });

    let outcome = source.pipe_to(&dest).await;
    assert_eq!(
        outcome,
        Err(StreamError::Sink("refused chunk 1".to_string()))
    );
    assert_eq!(source.state(), ReadableState::Closed);

    let reason = cancelled.lock().unwrap().clone().unwrap();
    assert!(reason.contains("refused chunk 1"));
}

#[tokio::test]
async fn test_pipe_prevent_cancel_leaves_source_readable() {
    let (source, cancelled) = ScriptedSource::new(1..=10);
    let source = ReadableStream::new(source);
    let dest = WritableStream::new(FailingSink { fail_on: 1 });

    let options = PipeOptions {
        prevent_cancel: true,
        ..PipeOptions::default()
    };
    let outcome = source.pipe_to_with(&dest, options).await;
    assert!(outcome.is_err());
    assert_eq!(source.state(), ReadableState::Readable);
    assert!(cancelled.lock().unwrap().is_none());

    // The rest of the script is still there for another consumer
    let reader = source.get_reader().unwrap();
    assert!(matches!(reader.read().await, Ok(Some(_))));
}

#[tokio::test]
async fn test_pipe_refused_while_source_is_locked() {
    let (source, _cancelled) = ScriptedSource::new([1]);
    let source = ReadableStream::new(source);
    let (sink, chunks, _events) = RecordingSink::new();
    let dest = WritableStream::new(sink);

    let _reader = source.get_reader().unwrap();
    assert_eq!(
        source.pipe_to(&dest).await,
        Err(StreamError::AlreadyLocked)
    );
    assert!(chunks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pipe_into_closed_destination_cancels_source() {
    let (source, cancelled) = ScriptedSource::new([1, 2]);
    let source = ReadableStream::new(source);
    let (sink, chunks, _events) = RecordingSink::new();
    let dest = WritableStream::new(sink);

    dest.close().await.unwrap();
    assert_eq!(source.pipe_to(&dest).await, Err(StreamError::Closed));
    assert_eq!(source.state(), ReadableState::Closed);
    assert!(cancelled.lock().unwrap().is_some());
    assert!(chunks.lock().unwrap().is_empty());
}
