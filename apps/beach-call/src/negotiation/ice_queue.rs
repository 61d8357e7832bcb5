use std::collections::VecDeque;

use crate::protocol::IceCandidate;

/// Candidates held until the connection can use them, kept in arrival order.
#[derive(Debug, Default)]
pub struct PendingIceQueue {
    items: VecDeque<IceCandidate>,
}

impl PendingIceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.items.push_back(candidate);
    }

    /// Empties the queue, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
