//! Pending audio queue
//!
//! Holds inbound network chunks that could not be handed to the player yet.
//! Chunks leave the queue in arrival order, and only after the player has
//! accepted them, so a failed hand-off never loses or duplicates audio.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ordered queue of raw PCM chunks awaiting delivery to the sink
#[derive(Debug, Default)]
pub struct PendingQueue {
    chunks: VecDeque<Bytes>,
    /// Bytes currently queued
    queued_bytes: usize,
    /// Chunks ever queued
    total_queued: u64,
    /// Chunks delivered from the queue
    total_delivered: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk at the tail
    pub fn push(&mut self, chunk: Bytes) {
        self.queued_bytes += chunk.len();
        self.total_queued += 1;
        self.chunks.push_back(chunk);
    }

    /// Oldest chunk, without removing it
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Remove the oldest chunk after it has been delivered
    pub fn pop_delivered(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.queued_bytes -= chunk.len();
        self.total_delivered += 1;
        Some(chunk)
    }

    /// Drop everything still queued, returning how many chunks were discarded
    pub fn discard(&mut self) -> usize {
        let discarded = self.chunks.len();
        self.chunks.clear();
        self.queued_bytes = 0;
        discarded
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn total_queued(&self) -> u64 {
        self.total_queued
    }

    pub fn total_delivered(&self) -> u64 {
        self.total_delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_and_accounting() {
        let mut queue = PendingQueue::new();
        queue.push(Bytes::from_static(b"aa"));
        queue.push(Bytes::from_static(b"bbb"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_bytes(), 5);

        assert_eq!(queue.front().map(|c| &c[..]), Some(&b"aa"[..]));
        assert_eq!(queue.pop_delivered().unwrap(), Bytes::from_static(b"aa"));
        assert_eq!(queue.queued_bytes(), 3);

        queue.push(Bytes::from_static(b"c"));
        assert_eq!(queue.pop_delivered().unwrap(), Bytes::from_static(b"bbb"));
        assert_eq!(queue.pop_delivered().unwrap(), Bytes::from_static(b"c"));
        assert!(queue.pop_delivered().is_none());
        assert_eq!(queue.total_queued(), 3);
        assert_eq!(queue.total_delivered(), 3);
    }

    #[test]
    fn test_discard() {
        let mut queue = PendingQueue::new();
        queue.push(Bytes::from_static(b"x"));
        queue.push(Bytes::from_static(b"y"));
        assert_eq!(queue.discard(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }
}
