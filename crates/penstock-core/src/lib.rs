pub mod error;
pub mod queue;
pub mod strategy;

pub use error::{Result, StreamError};
pub use queue::SizeQueue;
pub use strategy::{ByteLengthQueuingStrategy, ByteSized, CountQueuingStrategy, QueuingStrategy};
