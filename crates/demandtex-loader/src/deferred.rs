//! Deferred release of tile blocks.
//!
//! A tile block cannot be reused while a queued operation may still touch it.
//! Blocks are queued together with an event recorded after the last such
//! operation, and only returned to the allocator once that event completed.

use std::collections::VecDeque;

use demandtex_gpu::{MemoryAllocator, QueueEvent};

use crate::error::Result;
use crate::tile_allocator::{TileBlockAllocator, TileBlockHandle};

/// A block waiting for its last use to complete.
pub struct PendingRelease {
    /// The block to be freed.
    pub block: TileBlockHandle,
    /// Completes once the block is no longer in use.
    pub event: QueueEvent,
}

/// Queue of blocks awaiting release.
#[derive(Default)]
pub struct DeferredBlockRelease {
    pending: VecDeque<PendingRelease>,
}

impl DeferredBlockRelease {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `block` for release once `event` completes.
    pub fn queue(&mut self, block: TileBlockHandle, event: QueueEvent) {
        self.pending.push_back(PendingRelease { block, event });
    }

    /// Free every block whose event has completed. Returns the number freed.
    ///
    /// Events may belong to different queues, so the whole queue is scanned.
    pub fn process<A: MemoryAllocator>(&mut self, allocator: &mut TileBlockAllocator<A>) -> Result<usize> {
        let mut freed = 0;
        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].event.is_complete() {
                if let Some(pending) = self.pending.remove(index) {
                    allocator.free_tile_block(pending.block)?;
                    freed += 1;
                }
            } else {
                index += 1;
            }
        }
        Ok(freed)
    }

    /// Wait for every pending event and free all blocks.
    ///
    /// Call this during shutdown.
    pub fn flush<A: MemoryAllocator>(&mut self, allocator: &mut TileBlockAllocator<A>) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            pending.event.wait()?;
            allocator.free_tile_block(pending.block)?;
        }
        Ok(())
    }

    /// Get the number of pending releases.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
