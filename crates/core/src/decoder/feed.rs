use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use super::SlotId;
use crate::error::{FeedError, Result};

/// Default number of slot credits a feed queue can hold.
pub const DEFAULT_FEED_CAPACITY: usize = 100;

/// Bounded pool of free decoder input slots.
///
/// Bridges the decoder's asynchronous "input slot available" notifications
/// to the synchronous submission path:
///
/// - [`credit`](Self::credit) is called from the decoder's callback context
///   and never blocks.
/// - [`acquire`](Self::acquire) blocks the submitting thread until a slot is
///   free or the timeout elapses.
///
/// Slots come out in arrival order. A fresh queue is built for every decoder
/// configuration so credits of a previous decoder instance are never handed
/// out.
#[derive(Debug)]
pub struct FeedQueue {
    tx: Sender<SlotId>,
    rx: Receiver<SlotId>,
    capacity: usize,
}

impl FeedQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Record that the decoder released input slot `slot` to us.
    ///
    /// A full queue means the decoder credited more slots than it can own,
    /// which is a protocol violation; the credit is rejected.
    pub fn credit(&self, slot: SlotId) -> Result<()> {
        match self.tx.try_send(slot) {
            Ok(()) => {
                tracing::trace!(slot, available = self.rx.len(), "input slot credited");
                Ok(())
            }
            Err(e) => {
                let slot = e.into_inner();
                tracing::error!(
                    slot,
                    capacity = self.capacity,
                    "input slot credited beyond feed capacity"
                );
                Err(FeedError::SlotOverflow {
                    slot,
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Take a free input slot, waiting at most `timeout`.
    ///
    /// Returns `None` when no slot became available in time.
    pub fn acquire(&self, timeout: Duration) -> Option<SlotId> {
        match self.rx.recv_timeout(timeout) {
            Ok(slot) => Some(slot),
            Err(RecvTimeoutError::Timeout) => {
                tracing::trace!(timeout_ms = timeout.as_millis() as u64, "no input slot");
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discard every pending credit. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.rx.try_iter().count();
        if dropped > 0 {
            tracing::debug!(dropped, "feed queue cleared");
        }
        dropped
    }

    /// Number of credits currently available.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FeedQueue {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
