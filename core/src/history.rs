//! Bounded history windows handed to model callbacks.
use std::collections::VecDeque;

use ndarray::ArrayD;

use crate::error::Result;
use crate::state::State;

/// The most recent `capacity` entries, oldest first.
///
/// Entries are stored without a step axis; [`HistoryBuffer::current`] stacks them along a new
/// leading axis when a callback needs the window.
#[derive(Clone, Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    entries: VecDeque<State>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        HistoryBuffer {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// A zero-capacity buffer never stores anything.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push `entry`, evicting the oldest once the window is full.
    pub fn append(&mut self, entry: State) {
        if !self.is_enabled() {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The window stacked along axis 0, or `None` before anything has been recorded.
    pub fn current(&self) -> Result<Option<State>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let entries: Vec<State> = self.entries.iter().cloned().collect();
        State::stack(&entries, 0).map(Some)
    }

    /// Re-gather every stored entry along its particle `axis` so that the window follows the
    /// particles' new ancestry.
    pub fn reindex(&mut self, axis: usize, indices: &ArrayD<usize>) -> Result<()> {
        for entry in self.entries.iter_mut() {
            *entry = entry.gather(axis, indices)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
