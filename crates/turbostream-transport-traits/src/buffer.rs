//! Bounded FIFO used to hold inbound events between decode and delivery.

use std::collections::VecDeque;

use crate::config::{BufferConfig, BufferStrategy, high_water_count};

/// Bounded FIFO queue with a configurable eviction strategy.
///
/// The buffer itself is not synchronized; transports wrap it in a lock and
/// never hold that lock while invoking listeners.
#[derive(Debug, Clone)]
pub struct MessageBuffer<T> {
    items: VecDeque<T>,
    max_size: usize,
    strategy: BufferStrategy,
    high_water_mark: usize,
    dropped: u64,
}

impl<T> MessageBuffer<T> {
    /// Creates a buffer holding at most `max_size` items.
    ///
    /// `high_water_fraction` is converted to an absolute count of at least one item.
    pub fn new(max_size: usize, strategy: BufferStrategy, high_water_fraction: f64) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            strategy,
            high_water_mark: high_water_count(max_size, high_water_fraction),
            dropped: 0,
        }
    }

    /// Creates a buffer from a [`BufferConfig`].
    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(config.max_size, config.strategy, config.high_water_mark)
    }

    /// Appends an item, applying the eviction strategy when full.
    ///
    /// Returns `false` when the item was refused (`DropNewest` and `Block`).
    pub fn push(&mut self, item: T) -> bool {
        self.try_push(item).is_ok()
    }

    /// Like [`push`](Self::push) but hands a refused item back to the caller.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if !self.is_full() {
            self.items.push_back(item);
            return Ok(());
        }
        match self.strategy {
            BufferStrategy::DropOldest => {
                self.items.pop_front();
                self.dropped += 1;
                self.items.push_back(item);
                Ok(())
            }
            BufferStrategy::DropNewest => {
                self.dropped += 1;
                Err(item)
            }
            BufferStrategy::Block => Err(item),
            BufferStrategy::Unlimited => {
                self.items.push_back(item);
                Ok(())
            }
        }
    }

    /// Removes and returns the oldest item.
    pub fn shift(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of queued items.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` when the next push would trigger the strategy.
    ///
    /// Always `false` for [`BufferStrategy::Unlimited`].
    pub fn is_full(&self) -> bool {
        self.strategy != BufferStrategy::Unlimited && self.items.len() >= self.max_size
    }

    /// Returns `true` at or above the high-water mark.
    pub fn is_high_water(&self) -> bool {
        self.items.len() >= self.high_water_mark
    }

    /// Discards every queued item.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// High-water mark as an absolute item count.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Eviction strategy.
    pub fn strategy(&self) -> BufferStrategy {
        self.strategy
    }

    /// Items discarded by `DropOldest` evictions or `DropNewest` refusals.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<T: Clone> MessageBuffer<T> {
    /// Snapshot of the queued items, oldest first.
    pub fn get_all(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
