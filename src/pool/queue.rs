//! Dispatch queue: bounded FIFO of job ids waiting for a worker.

use std::collections::VecDeque;

use super::job::JobId;

/// Bounded FIFO of queued job ids.
#[derive(Debug)]
pub struct DispatchQueue {
    ids: VecDeque<JobId>,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append to the tail. Returns false (and leaves the queue untouched) if full.
    pub fn push(&mut self, id: JobId) -> bool {
        if self.is_full() {
            return false;
        }
        self.ids.push_back(id);
        true
    }

    /// Take the head.
    pub fn pop(&mut self) -> Option<JobId> {
        self.ids.pop_front()
    }

    /// Zero-based position of `id`, if queued.
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.ids.iter().position(|queued| queued == id)
    }

    /// Remove `id` wherever it sits. Returns whether it was queued.
    pub fn remove(&mut self, id: &JobId) -> bool {
        match self.position(id) {
            Some(index) => self.ids.remove(index).is_some(),
            None => false,
        }
    }

    /// Empty the queue, head first.
    pub fn drain(&mut self) -> Vec<JobId> {
        self.ids.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
