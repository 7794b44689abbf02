//! Outbound message queue (L3).
//!
//! A mutex-guarded pair of deques of already-encoded JSON strings. Urgent
//! traffic (heartbeats, presence, voice state) drains ahead of bulk
//! requests such as member chunking, and within each priority class
//! messages keep their enqueue order.

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Segments {
    front: VecDeque<String>,
    back: VecDeque<String>,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<Segments>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, message: String) {
        self.lock().back.push_back(message);
    }

    /// Enqueue into the urgent segment. Urgent messages drain before
    /// anything pushed with [`Self::push_back`], FIFO among themselves.
    pub fn push_front(&self, message: String) {
        self.lock().front.push_back(message);
    }

    pub fn pop_front(&self) -> Option<String> {
        let mut segments = self.lock();
        segments.front.pop_front().or_else(|| segments.back.pop_front())
    }

    /// Drop everything queued, used when a dead connection's backlog
    /// would be stale on the next session.
    pub fn clear(&self) {
        let mut segments = self.lock();
        segments.front.clear();
        segments.back.clear();
    }

    pub fn len(&self) -> usize {
        let segments = self.lock();
        segments.front.len() + segments.back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Segments> {
        // A poisoned queue mutex means a panic mid push/pop of a String,
        // which cannot leave the deques inconsistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_insertion_takes_precedence() {
        let queue = OutboundQueue::new();
        queue.push_back("A".into());
        queue.push_back("B".into());
        queue.push_front("H".into());
        queue.push_back("C".into());

        let drained: Vec<_> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(drained, ["H", "A", "B", "C"]);
    }

    #[test]
    fn fifo_within_each_priority() {
        let queue = OutboundQueue::new();
        queue.push_back("A".into());
        queue.push_front("H1".into());
        queue.push_front("H2".into());
        queue.push_back("B".into());

        let drained: Vec<_> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(drained, ["H1", "H2", "A", "B"]);
    }

    #[test]
    fn urgent_messages_never_wait_behind_bulk() {
        let queue = OutboundQueue::new();
        for i in 0..10 {
            queue.push_back(format!("chunk-{i}"));
        }
        queue.push_front("heartbeat".into());
        assert_eq!(queue.pop_front().as_deref(), Some("heartbeat"));
        assert_eq!(queue.pop_front().as_deref(), Some("chunk-0"));
    }

    #[test]
    fn clear_and_len() {
        let queue = OutboundQueue::new();
        assert!(queue.is_empty());
        queue.push_back("x".into());
        queue.push_front("y".into());
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.pop_front().is_none());
        assert!(queue.is_empty());
    }
}
