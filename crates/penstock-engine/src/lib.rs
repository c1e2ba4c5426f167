//! Penstock Engine - Writable and Readable stream machinery
//!
//! This crate provides the async stream engine on top of `penstock-core`:
//! writable streams that drain a sized queue into a pluggable [`Sink`],
//! readable streams that pull from a pluggable [`Source`] on demand,
//! exclusive readers, and piping between the two. Chunks are queued
//! synchronously and delivered by background tasks; backpressure is
//! advisory and surfaces through [`WritableStream::ready`] and
//! [`ReadableStreamController::desired_size`].
//!
//! # Examples
//!
//! ## Writing
//!
//! ```ignore
//! use penstock_engine::{Sink, WritableStream};
//!
//! let stream = WritableStream::new(MySink::connect(addr).await?);
//!
//! stream.write(chunk).await?;
//! stream.close().await?;
//! ```
//!
//! ## Reading
//!
//! ```ignore
//! use penstock_engine::{ReadableStream, Source};
//!
//! let stream = ReadableStream::new(MySource::open(path)?);
//! let reader = stream.get_reader()?;
//!
//! while let Some(chunk) = reader.read().await? {
//!     process(chunk);
//! }
//! ```

pub mod controller;
pub mod pipe;
pub mod readable;
pub mod reader;
pub mod settlement;
pub mod sink;
pub mod source;
pub mod writable;

pub use controller::ReadableStreamController;
pub use pipe::PipeOptions;
pub use readable::{ReadableState, ReadableStream};
pub use reader::ReadableStreamReader;
pub use settlement::Settlement;
pub use sink::{ErrorSignal, Sink};
pub use source::Source;
pub use writable::{WritableState, WritableStream};

pub use penstock_core::{
    ByteLengthQueuingStrategy, ByteSized, CountQueuingStrategy, QueuingStrategy, Result,
    SizeQueue, StreamError,
};
