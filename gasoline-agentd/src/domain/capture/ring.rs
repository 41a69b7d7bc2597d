use std::collections::VecDeque;

/// Fixed-capacity FIFO buffer. Pushing past capacity evicts the oldest entry.
///
/// Every pushed entry gets a monotonically increasing position, which
/// observe pagination hands out as cursors.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    total_added: u64,
    evicted: u64,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            total_added: 0,
            evicted: 0,
        }
    }

    /// Returns the evicted entry, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.total_added += 1;
        if self.capacity == 0 {
            self.evicted += 1;
            return Some(item);
        }
        let dropped = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Shrinking drops the oldest entries first. Returns how many were dropped.
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity;
        let mut dropped = 0;
        while self.items.len() > capacity {
            self.items.pop_front();
            dropped += 1;
        }
        self.evicted += dropped as u64;
        dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn iter_newest(&self) -> impl Iterator<Item = &T> {
        self.items.iter().rev()
    }

    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Position of the oldest retained entry.
    pub fn oldest_position(&self) -> u64 {
        self.total_added - self.items.len() as u64
    }

    /// Retained entries with their positions, oldest first.
    pub fn iter_positioned(&self) -> impl Iterator<Item = (u64, &T)> {
        let oldest = self.oldest_position();
        self.items
            .iter()
            .enumerate()
            .map(move |(offset, item)| (oldest + offset as u64, item))
    }
}
