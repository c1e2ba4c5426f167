//! Piping: pump a readable stream into a writable stream, propagating
//! backpressure, end of data, and failures in both directions.

use tracing::debug;

use penstock_core::{Result, StreamError};

use crate::readable::ReadableStream;
use crate::reader::ReadableStreamReader;
use crate::writable::{WritableState, WritableStream};

/// Controls which side of a pipe survives the other side's end.
///
/// All flags default to off: end of data closes the destination, a source
/// failure aborts the destination, and a destination failure cancels the
/// source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeOptions {
    /// Leave the destination open after the source ends.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination fails.
    pub prevent_cancel: bool,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pump this stream into `dest` until end of data or failure, with
    /// default teardown on both sides.
    ///
    /// Holds the stream's reader lock for the duration. Waits out the
    /// destination's backpressure before each read, so no more than one
    /// chunk is in flight past the destination's high water mark.
    pub async fn pipe_to(&self, dest: &WritableStream<T>) -> Result<()> {
        self.pipe_to_with(dest, PipeOptions::default()).await
    }

    /// [`pipe_to`](Self::pipe_to) with explicit teardown behavior.
    pub async fn pipe_to_with(
        &self,
        dest: &WritableStream<T>,
        options: PipeOptions,
    ) -> Result<()> {
        let reader = self.get_reader()?;
        let outcome = pump(&reader, dest, options).await;
        if let Err(error) = &outcome {
            debug!(%error, "pipe finished with failure");
        }
        outcome
    }
}

async fn pump<T: Send + 'static>(
    reader: &ReadableStreamReader<T>,
    dest: &WritableStream<T>,
    options: PipeOptions,
) -> Result<()> {
    loop {
        // A destination that is shutting down on its own can no longer
        // accept the source's data.
        match dest.state() {
            WritableState::Closing => {
                return drop_source(reader, &options, StreamError::Closing).await;
            }
            WritableState::Closed => {
                return drop_source(reader, &options, StreamError::Closed).await;
            }
            _ => {}
        }

        tokio::select! {
            ready = dest.ready() => {
                if let Err(error) = ready {
                    return drop_source(reader, &options, error).await;
                }
            }
            settled = reader.closed() => {
                if let Err(error) = settled {
                    return drop_dest(dest, &options, error).await;
                }
                // Clean close: fall through and let read() drain to None.
            }
        }

        match reader.read().await {
            Ok(Some(chunk)) => {
                // Submit without awaiting the ack; the ready() gate above
                // is what paces the pump.
                let _submitted = dest.write(chunk);
            }
            Ok(None) => {
                return if options.prevent_close {
                    Ok(())
                } else {
                    dest.close().await
                };
            }
            Err(error) => {
                return drop_dest(dest, &options, error).await;
            }
        }
    }
}

/// The destination failed or left: detach from the source and report.
async fn drop_source<T: Send + 'static>(
    reader: &ReadableStreamReader<T>,
    options: &PipeOptions,
    error: StreamError,
) -> Result<()> {
    if !options.prevent_cancel {
        let _ = reader.cancel(error.to_string()).await;
    }
    Err(error)
}

/// The source failed: tear the destination down and report.
async fn drop_dest<T: Send + 'static>(
    dest: &WritableStream<T>,
    options: &PipeOptions,
    error: StreamError,
) -> Result<()> {
    if !options.prevent_abort {
        let _ = dest.abort(error.to_string()).await;
    }
    Err(error)
}
