use super::{StreamError, StreamResult};
use std::collections::VecDeque;

/// FIFO of values paired with their strategy size, with a running total.
pub(crate) struct SizedQueue<V> {
    entries: VecDeque<(V, f64)>,
    total_size: f64,
}

impl<V> SizedQueue<V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Append a value. Sizes must be finite and non-negative.
    pub(crate) fn enqueue(&mut self, value: V, size: f64) -> StreamResult<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::sizing(format!(
                "chunk size must be a finite, non-negative number (got {size})"
            )));
        }
        self.entries.push_back((value, size));
        self.total_size += size;
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<V> {
        let (value, size) = self.entries.pop_front()?;
        self.total_size -= size;
        // float subtraction can drift below zero
        if self.total_size < 0.0 {
            self.total_size = 0.0;
        }
        Some(value)
    }

    pub(crate) fn peek(&self) -> Option<&V> {
        self.entries.front().map(|(value, _)| value)
    }

    pub(crate) fn peek_mut(&mut self) -> Option<&mut V> {
        self.entries.front_mut().map(|(value, _)| value)
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    pub(crate) fn total_size(&self) -> f64 {
        self.total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
