//! Fixed-capacity circular history
//!
//! `RingBuffer<T>` is the bounded-history primitive used by the probe workers
//! (per-bucket results, per-address pending echoes). Once full, every push
//! overwrites the oldest element.
//!
//! ## Layout
//!
//! ```text
//! storage: [ e3 | e4 | e0 | e1 | e2 ]
//!                     ^start          count = 5
//! ```
//!
//! Slots are allocated lazily, so an idle buffer with a large capacity costs
//! nothing until it is written to. The buffer has no internal locking; owners
//! that share it across tasks wrap it in their own mutex.

use serde::{Serialize, Serializer};

/// Result of a per-item callback passed to [`RingBuffer::scan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<E> {
    /// Keep walking
    Continue,

    /// Stop at the current item
    Stop,

    /// Abort the walk with an error
    Fail(E),
}

/// Fixed-capacity FIFO that overwrites its oldest entry once full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// Index of the oldest element
    start: usize,

    /// Number of live elements
    count: usize,

    /// Maximum number of elements
    capacity: usize,

    /// Backing slots, grown up to `capacity`
    elements: Vec<T>,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. A capacity of zero is clamped to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            start: 0,
            count: 0,
            capacity,
            elements: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn end(&self) -> usize {
        (self.start + self.count) % self.capacity
    }

    fn slot(&self, idx: usize) -> usize {
        (self.start + idx) % self.capacity
    }

    /// Append `value`, overwriting the oldest element when full
    pub fn push(&mut self, value: T) {
        let end = self.end();
        if end == self.elements.len() {
            self.elements.push(value);
        } else {
            self.elements[end] = value;
        }

        if self.is_full() {
            self.start = (self.start + 1) % self.capacity;
        } else {
            self.count += 1;
        }
    }

    /// The `idx`-th oldest element, `None` when `idx >= size()`
    pub fn get(&self, idx: usize) -> Option<&T> {
        if idx >= self.count {
            return None;
        }
        self.elements.get(self.slot(idx))
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&T> {
        self.count.checked_sub(1).and_then(|idx| self.get(idx))
    }

    /// Remove the oldest element, returning a reference to its (still
    /// allocated) slot
    pub fn pop(&mut self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }

        let idx = self.start;
        self.start = (self.start + 1) % self.capacity;
        self.count -= 1;
        self.elements.get(idx)
    }

    /// Discard the `n` oldest elements
    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.count);
        self.start = (self.start + n) % self.capacity;
        self.count -= n;
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.count = 0;
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        (0..self.count).map(move |idx| &self.elements[self.slot(idx)])
    }

    /// Walk oldest to newest until the callback stops or fails.
    ///
    /// Returns the index the walk stopped at, `None` if every item was
    /// visited.
    pub fn scan<E, F>(&self, mut f: F) -> Result<Option<usize>, E>
    where
        F: FnMut(usize, &T) -> Flow<E>,
    {
        for (idx, item) in self.iter().enumerate() {
            match f(idx, item) {
                Flow::Continue => {}
                Flow::Stop => return Ok(Some(idx)),
                Flow::Fail(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Materialize all elements oldest to newest
    pub fn all(&self) -> Vec<T> {
        let mut res = Vec::with_capacity(self.count);
        res.extend(self.iter().cloned());
        res
    }
}

impl<T: Default> RingBuffer<T> {
    /// Reserve the next write slot and hand it out for in-place filling.
    ///
    /// When the buffer is full the oldest element is released immediately, so
    /// the slot being written is never observable until [`commit_push`].
    ///
    /// [`commit_push`]: RingBuffer::commit_push
    pub fn begin_push(&mut self) -> &mut T {
        let end = self.end();
        if end == self.elements.len() {
            self.elements.push(T::default());
        }

        if self.is_full() {
            self.start = (self.start + 1) % self.capacity;
            self.count -= 1;
        }
        &mut self.elements[end]
    }

    /// Publish the slot handed out by the last `begin_push`
    pub fn commit_push(&mut self) {
        if self.count != self.capacity {
            self.count += 1;
        }
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}
