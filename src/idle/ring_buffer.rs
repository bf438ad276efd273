//! Fixed-capacity ring buffer of recent samples.

/// Keeps the `capacity` most recent samples; pushing onto a full buffer
/// evicts the oldest one.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    elements: Vec<T>,
    capacity: usize,
    start: usize,
}

impl<T: Copy> RingBuffer<T> {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            elements: Vec::with_capacity(capacity),
            capacity,
            start: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.elements.len() == self.capacity {
            self.elements[self.start] = value;
            self.start = (self.start + 1) % self.capacity;
        } else {
            debug_assert_eq!(self.start, 0);
            self.elements.push(value);
        }
    }

    pub fn count(&self) -> usize {
        self.elements.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.elements.len() == self.capacity
    }

    /// Fold over the stored samples.
    pub fn sum<F>(&self, initial: T, mut f: F) -> T
    where
        F: FnMut(T, T) -> T,
    {
        self.elements.iter().fold(initial, |acc, v| f(acc, *v))
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = self.elements.split_at(self.start);
        older.iter().chain(newer.iter())
    }

    pub fn reset(&mut self) {
        self.elements.clear();
        self.start = 0;
    }
}
