//! Size-accounted FIFO queue.
//!
//! `SizeQueue` is the backpressure accounting primitive shared by both sides
//! of the engine: every entry carries the cost assigned to it at enqueue time
//! by the active queuing strategy, and `total_size()` reports the cost of
//! everything still queued. The queue knows nothing about thresholds or
//! states; backpressure policy lives in the stream that owns it.

use std::collections::VecDeque;

/// A single queued entry: the value plus the size it was charged at enqueue
/// time. The size is never recomputed after admission.
#[derive(Debug)]
struct SizeEntry<V> {
    value: V,
    size: u64,
}

/// FIFO queue of `(value, size)` pairs with a summed total size.
///
/// `total_size()` is computed by summation over the live entries on each call
/// rather than being maintained incrementally, so the total can never drift
/// from the entries it describes.
#[derive(Debug)]
pub struct SizeQueue<V> {
    entries: VecDeque<SizeEntry<V>>,
}

impl<V> SizeQueue<V> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a value charged at the given size.
    pub fn enqueue(&mut self, value: V, size: u64) {
        self.entries.push_back(SizeEntry { value, size });
    }

    /// Remove and return the front value, or `None` if the queue is empty.
    pub fn dequeue(&mut self) -> Option<V> {
        self.entries.pop_front().map(|entry| entry.value)
    }

    /// Return a reference to the front value without removing it.
    pub fn peek(&self) -> Option<&V> {
        self.entries.front().map(|entry| &entry.value)
    }

    /// Mutable variant of [`peek`](Self::peek).
    ///
    /// Lets a caller take contents out of the front entry while the entry
    /// itself stays queued and accounted, which is how an in-flight chunk
    /// keeps counting toward backpressure until it is accepted.
    pub fn peek_mut(&mut self) -> Option<&mut V> {
        self.entries.front_mut().map(|entry| &mut entry.value)
    }

    /// Sum of the sizes of all queued entries.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<V> Default for SizeQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}
