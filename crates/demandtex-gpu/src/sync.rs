//! Synchronization primitives.

use std::sync::Arc;

use crate::command::QueueInner;
use crate::error::Result;

/// Marks a point in a queue's submission order.
///
/// The event completes once every command submitted before it was recorded
/// has retired.
#[derive(Clone)]
pub struct QueueEvent {
    queue: Arc<QueueInner>,
    seq: u64,
}

impl QueueEvent {
    pub(crate) fn new(queue: Arc<QueueInner>, seq: u64) -> Self {
        Self { queue, seq }
    }

    /// Check whether the event has completed, without blocking.
    pub fn is_complete(&self) -> bool {
        self.queue.retired() >= self.seq
    }

    /// Block until the event completes.
    pub fn wait(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        self.queue.retire_through(self.seq)
    }
}

impl std::fmt::Debug for QueueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEvent")
            .field("seq", &self.seq)
            .field("complete", &self.is_complete())
            .finish()
    }
}
