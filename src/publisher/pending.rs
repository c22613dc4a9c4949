use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{MessageId, Result};

/// One outbound message waiting for local acceptance.
///
/// An entry is queued exactly while it sits in a [`PendingQueue`]; leaving
/// the queue (handoff, timeout or close) happens once and consumes it.
pub(super) struct PendingEntry {
    pub(super) id: MessageId,
    pub(super) payload: Bytes,
    completion: oneshot::Sender<Result<()>>,
}

impl PendingEntry {
    /// Create an entry and the receiver its publisher awaits.
    pub(super) fn new(payload: Bytes) -> (Self, oneshot::Receiver<Result<()>>) {
        // ---
        let (completion, rx) = oneshot::channel();
        let entry = Self {
            id: MessageId::generate(),
            payload,
            completion,
        };
        (entry, rx)
    }

    /// Resolve the caller's future. A caller that stopped waiting is ignored.
    pub(super) fn settle(self, result: Result<()>) {
        let _ = self.completion.send(result);
    }
}

/// Bounded FIFO of pending entries.
pub(super) struct PendingQueue {
    // ---
    entries: VecDeque<PendingEntry>,
    capacity: usize,
}

impl PendingQueue {
    // ---

    pub(super) fn new(capacity: usize) -> Self {
        // ---
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Append at the tail. The caller checks [`is_full`](Self::is_full) first.
    pub(super) fn push_back(&mut self, entry: PendingEntry) {
        debug_assert!(!self.is_full());
        self.entries.push_back(entry);
    }

    pub(super) fn head(&self) -> Option<&PendingEntry> {
        self.entries.front()
    }

    /// Pop the head and resolve it successfully.
    ///
    /// Returns false if the queue was empty.
    pub(super) fn complete_head(&mut self) -> bool {
        // ---
        match self.entries.pop_front() {
            Some(entry) => {
                entry.settle(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Take an entry out of the queue, wherever it sits.
    ///
    /// Used for timeout cleanup.
    pub(super) fn remove(&mut self, id: MessageId) -> Option<PendingEntry> {
        // ---
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(index)
    }

    /// Empty the queue, returning the entries in FIFO order.
    pub(super) fn drain_all(&mut self) -> Vec<PendingEntry> {
        self.entries.drain(..).collect()
    }
}
