use std::collections::VecDeque;

/// Keeps the most recent `capacity` items, evicting the oldest first.
#[derive(Debug, Clone)]
pub struct CyclicBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> CyclicBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        CyclicBuffer {
            // Large capacities are rarely filled, don't reserve all of it up front.
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// A zero-capacity buffer discards everything.
    pub fn add(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Removes and returns all items, oldest first.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
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
}
