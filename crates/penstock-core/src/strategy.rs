//! Queuing strategies: how chunks are costed and when backpressure applies.
//!
//! A strategy pairs a `high_water_mark` threshold with a `size` function that
//! assigns each chunk a cost at enqueue time. The two standard strategies are
//! provided here: [`CountQueuingStrategy`] (every chunk costs 1) and
//! [`ByteLengthQueuingStrategy`] (a chunk costs its byte length, as reported
//! by the [`ByteSized`] trait). Custom strategies implement
//! [`QueuingStrategy`] directly; a failing `size` function errors the whole
//! stream because queue accounting is no longer trustworthy afterward.

use bytes::{Bytes, BytesMut};

use crate::error::Result;

/// Policy object consulted by a stream to cost chunks and decide when
/// backpressure applies.
///
/// `high_water_mark` is the threshold the owning stream compares its queue's
/// total size against: strictly above the mark applies backpressure, strictly
/// below relieves it.
pub trait QueuingStrategy<T>: Send + Sync {
    /// Threshold total size above which backpressure is applied.
    fn high_water_mark(&self) -> u64;

    /// Cost assigned to a chunk at enqueue time.
    ///
    /// The built-in strategies never fail; a custom strategy that does fail
    /// causes the owning stream to transition to its errored state.
    fn size(&self, chunk: &T) -> Result<u64>;
}

/// Strategy that charges every chunk a cost of 1, making the high-water mark
/// a simple element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountQueuingStrategy {
    high_water_mark: u64,
}

impl CountQueuingStrategy {
    /// Create a count strategy with the given mark. A mark of 0 is
    /// normalized to 1 so a stream can always hold at least one chunk
    /// without immediately applying backpressure.
    pub fn new(high_water_mark: u64) -> Self {
        Self {
            high_water_mark: high_water_mark.max(1),
        }
    }
}

impl Default for CountQueuingStrategy {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    fn size(&self, _chunk: &T) -> Result<u64> {
        Ok(1)
    }
}

/// Strategy that charges every chunk its byte length, making the high-water
/// mark a buffered-byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: u64,
}

impl ByteLengthQueuingStrategy {
    /// Create a byte-length strategy with the given mark in bytes. A mark of
    /// 0 is normalized to 1.
    pub fn new(high_water_mark: u64) -> Self {
        Self {
            high_water_mark: high_water_mark.max(1),
        }
    }
}

impl Default for ByteLengthQueuingStrategy {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T: ByteSized> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    fn size(&self, chunk: &T) -> Result<u64> {
        Ok(chunk.byte_len() as u64)
    }
}

/// Chunk types that can report their byte length.
///
/// Implementing this trait is what makes a chunk type usable with
/// [`ByteLengthQueuingStrategy`]; there is no runtime probing or footprint
/// estimation for types that don't.
pub trait ByteSized {
    /// Payload length in bytes.
    fn byte_len(&self) -> usize;
}

impl ByteSized for Bytes {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for BytesMut {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for Box<[u8]> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl<const N: usize> ByteSized for [u8; N] {
    fn byte_len(&self) -> usize {
        N
    }
}

impl ByteSized for &[u8] {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for String {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteSized for &str {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl<T: ByteSized> ByteSized for Option<T> {
    fn byte_len(&self) -> usize {
        self.as_ref().map_or(0, ByteSized::byte_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;

    // ---------------------------------------------------------------
    // CountQueuingStrategy
    // ---------------------------------------------------------------

    #[test]
    fn test_count_strategy_costs_one() {
        let strategy = CountQueuingStrategy::new(16);
        assert_eq!(QueuingStrategy::<&str>::size(&strategy, &"anything"), Ok(1));
        assert_eq!(QueuingStrategy::<Vec<u8>>::size(&strategy, &vec![0; 100]), Ok(1));
        assert_eq!(QueuingStrategy::<&str>::high_water_mark(&strategy), 16);
    }

    #[test]
    fn test_count_strategy_default_mark_is_one() {
        let strategy = CountQueuingStrategy::default();
        assert_eq!(QueuingStrategy::<u8>::high_water_mark(&strategy), 1);
    }

    #[test]
    fn test_count_strategy_zero_mark_normalized() {
        let strategy = CountQueuingStrategy::new(0);
        assert_eq!(QueuingStrategy::<u8>::high_water_mark(&strategy), 1);
    }

    // ---------------------------------------------------------------
    // ByteLengthQueuingStrategy
    // ---------------------------------------------------------------

    #[test]
    fn test_byte_length_strategy_costs_payload_bytes() {
        let strategy = ByteLengthQueuingStrategy::new(1024);
        assert_eq!(strategy.size(&Bytes::from("hello")), Ok(5));
        assert_eq!(strategy.size(&vec![0u8; 300]), Ok(300));
        assert_eq!(strategy.size(&String::from("ab")), Ok(2));
        assert_eq!(
            QueuingStrategy::<Bytes>::high_water_mark(&strategy),
            1024
        );
    }

    #[test]
    fn test_byte_length_strategy_zero_mark_normalized() {
        let strategy = ByteLengthQueuingStrategy::new(0);
        assert_eq!(QueuingStrategy::<Bytes>::high_water_mark(&strategy), 1);
    }

    #[test]
    fn test_byte_length_empty_chunk_costs_zero() {
        let strategy = ByteLengthQueuingStrategy::new(8);
        assert_eq!(strategy.size(&Bytes::new()), Ok(0));
    }

    // ---------------------------------------------------------------
    // ByteSized implementations
    // ---------------------------------------------------------------

    #[test]
    fn test_byte_sized_buffer_types() {
        assert_eq!(Bytes::from("abcd").byte_len(), 4);
        assert_eq!(BytesMut::from(&b"abc"[..]).byte_len(), 3);
        assert_eq!(vec![1u8, 2, 3].byte_len(), 3);
        assert_eq!(vec![1u8, 2].into_boxed_slice().byte_len(), 2);
        assert_eq!([0u8; 7].byte_len(), 7);
        assert_eq!((&b"xy"[..]).byte_len(), 2);
    }

    #[test]
    fn test_byte_sized_strings_use_utf8_length() {
        assert_eq!("héllo".byte_len(), 6);
        assert_eq!(String::from("héllo").byte_len(), 6);
    }

    #[test]
    fn test_byte_sized_option() {
        assert_eq!(Some(Bytes::from("abc")).byte_len(), 3);
        assert_eq!(Option::<Bytes>::None.byte_len(), 0);
    }

    // ---------------------------------------------------------------
    // Custom fallible strategy
    // ---------------------------------------------------------------

    struct RejectingStrategy;

    impl QueuingStrategy<u32> for RejectingStrategy {
        fn high_water_mark(&self) -> u64 {
            1
        }

        fn size(&self, chunk: &u32) -> Result<u64> {
            if *chunk == 0 {
                Err(StreamError::SizeFunction("zero chunk".to_string()))
            } else {
                Ok(u64::from(*chunk))
            }
        }
    }

    #[test]
    fn test_custom_strategy_can_fail() {
        let strategy = RejectingStrategy;
        assert_eq!(strategy.size(&3), Ok(3));
        assert_eq!(
            strategy.size(&0),
            Err(StreamError::SizeFunction("zero chunk".to_string()))
        );
    }

    #[test]
    fn test_strategies_are_object_safe() {
        let count: Box<dyn QueuingStrategy<Bytes>> = Box::new(CountQueuingStrategy::new(4));
        let bytes: Box<dyn QueuingStrategy<Bytes>> = Box::new(ByteLengthQueuingStrategy::new(64));
        assert_eq!(count.size(&Bytes::from("xxxx")), Ok(1));
        assert_eq!(bytes.size(&Bytes::from("xxxx")), Ok(4));
    }
}
