//! Ring Buffer Implementation

use std::collections::VecDeque;

/// Bounded ring that evicts the oldest element when full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// Elements, oldest at the front
    storage: VecDeque<T>,
    /// Maximum number of retained elements
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with given capacity
    ///
    /// A capacity of zero is allowed and retains nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an element, returning the evicted oldest element if the ring was full
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }

        let evicted = if self.storage.len() >= self.capacity {
            self.storage.pop_front()
        } else {
            None
        };
        self.storage.push_back(item);
        evicted
    }

    /// Number of elements currently retained
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.len() as f64 / self.capacity as f64
    }

    /// Most recently pushed element
    pub fn latest(&self) -> Option<&T> {
        self.storage.back()
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.storage.iter()
    }

    /// Count retained elements matching a predicate
    pub fn count_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        self.storage.iter().filter(|item| predicate(item)).count()
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Read the last N elements in arrival order (oldest of them first)
    ///
    /// Returns every retained element when fewer than `count` are available.
    pub fn read_last(&self, count: usize) -> Vec<T> {
        let count = count.min(self.storage.len());
        let skip = self.storage.len() - count;
        self.storage.iter().skip(skip).cloned().collect()
    }
}
