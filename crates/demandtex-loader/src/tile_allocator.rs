//! Backing store for sparse tiles and mip tails.
//!
//! Blocks are sub-allocated first-fit out of large pools obtained from a
//! [`MemoryAllocator`]. Freed blocks return to their pool's free list, where
//! adjacent ranges coalesce. Pools are never released before the allocator
//! is torn down.

use demandtex_core::geometry::align_to_tile;
use demandtex_gpu::{Allocation, MemoryAllocator, TextureTileAllocator};

use crate::error::{Error, Result};

/// Location of a block within the pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileBlockDesc {
    pool: u32,
    offset: usize,
    size: usize,
}

impl TileBlockDesc {
    /// Index of the pool holding the block.
    pub const fn pool(&self) -> u32 {
        self.pool
    }

    /// Byte offset of the block in its pool.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Block size in bytes (a whole number of tiles).
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// A block of backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileBlockHandle {
    /// The pool the block lives in.
    pub allocation: Allocation,
    /// Where in the pool.
    pub block: TileBlockDesc,
}

/// Pool usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileBlockStatistics {
    /// Number of pools
    pub num_pools: usize,
    /// Bytes held in pools
    pub bytes_reserved: usize,
    /// Bytes handed out as blocks
    pub bytes_in_use: usize,
    /// Blocks handed out
    pub blocks_in_use: usize,
}

struct Pool {
    allocation: Allocation,
    size: usize,
    /// Free (offset, size) ranges sorted by offset.
    free: Vec<(usize, usize)>,
}

impl Pool {
    fn take(&mut self, size: usize) -> Option<usize> {
        let index = self.free.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free[index];
        if len == size {
            self.free.remove(index);
        } else {
            self.free[index] = (offset + size, len - size);
        }
        Some(offset)
    }

    fn give_back(&mut self, offset: usize, size: usize) {
        let index = self.free.partition_point(|&(start, _)| start < offset);
        self.free.insert(index, (offset, size));

        if index + 1 < self.free.len() {
            let (start, len) = self.free[index];
            let (next_start, next_len) = self.free[index + 1];
            if start + len == next_start {
                self.free[index].1 += next_len;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_start, prev_len) = self.free[index - 1];
            let (start, len) = self.free[index];
            if prev_start + prev_len == start {
                self.free[index - 1].1 += len;
                self.free.remove(index);
            }
        }
    }

    fn contains_free(&self, offset: usize, size: usize) -> bool {
        self.free
            .iter()
            .any(|&(start, len)| offset < start + len && start < offset + size)
    }
}

/// Sub-allocator of tile blocks.
pub struct TileBlockAllocator<A: MemoryAllocator = TextureTileAllocator> {
    allocator: A,
    pool_size: usize,
    max_memory: usize,
    pools: Vec<Pool>,
    stats: TileBlockStatistics,
}

impl<A: MemoryAllocator> TileBlockAllocator<A> {
    /// Create an allocator that grows by `pool_size` bytes at a time.
    ///
    /// `max_memory` caps the bytes held in pools (0 for no cap beyond the
    /// device budget).
    pub fn new(allocator: A, pool_size: usize, max_memory: usize) -> Self {
        Self {
            allocator,
            pool_size: align_to_tile(pool_size.max(1)),
            max_memory,
            pools: Vec::new(),
            stats: TileBlockStatistics::default(),
        }
    }

    /// Pool growth size in bytes.
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Whether block allocations are opaque handles.
    pub fn allocation_is_handle(&self) -> bool {
        self.allocator.allocation_is_handle()
    }

    /// Current usage.
    pub const fn statistics(&self) -> TileBlockStatistics {
        self.stats
    }

    /// Allocate a block of at least `size` bytes, rounded up to whole tiles.
    pub fn allocate_tile_block(&mut self, size: usize) -> Result<TileBlockHandle> {
        let size = align_to_tile(size.max(1));

        let found = self
            .pools
            .iter_mut()
            .enumerate()
            .find_map(|(index, pool)| pool.take(size).map(|offset| (index, offset)));
        let (pool, offset) = match found {
            Some(found) => found,
            None => (self.grow(size)?, 0),
        };

        self.stats.bytes_in_use += size;
        self.stats.blocks_in_use += 1;
        Ok(TileBlockHandle {
            allocation: self.pools[pool].allocation,
            block: TileBlockDesc {
                pool: pool as u32,
                offset,
                size,
            },
        })
    }

    /// Add a pool that can hold `size` bytes and take its first `size` bytes.
    fn grow(&mut self, size: usize) -> Result<usize> {
        let pool_size = self.pool_size.max(size);
        if self.max_memory > 0 && self.stats.bytes_reserved + pool_size > self.max_memory {
            return Err(Error::OutOfMemory {
                requested: pool_size,
                available: self.max_memory.saturating_sub(self.stats.bytes_reserved),
            });
        }

        let allocation = self.allocator.allocate(pool_size, None)?;
        let free = if pool_size > size {
            vec![(size, pool_size - size)]
        } else {
            Vec::new()
        };
        self.pools.push(Pool {
            allocation,
            size: pool_size,
            free,
        });
        self.stats.num_pools += 1;
        self.stats.bytes_reserved += pool_size;
        tracing::debug!(pools = self.pools.len(), pool_size, "Grew tile pool");
        Ok(self.pools.len() - 1)
    }

    /// Return a block to its pool.
    ///
    /// The caller guarantees that no queued operation still uses the block.
    pub fn free_tile_block(&mut self, handle: TileBlockHandle) -> Result<()> {
        let block = handle.block;
        let pool = self
            .pools
            .get_mut(block.pool as usize)
            .filter(|pool| pool.allocation == handle.allocation)
            .ok_or_else(|| Error::InvalidState(format!("block {block:?} does not belong to this allocator")))?;
        if block.offset + block.size > pool.size || pool.contains_free(block.offset, block.size) {
            return Err(Error::InvalidState(format!("block {block:?} is not allocated")));
        }

        pool.give_back(block.offset, block.size);
        self.stats.bytes_in_use -= block.size;
        self.stats.blocks_in_use -= 1;
        Ok(())
    }

    /// Release every pool. Outstanding blocks become invalid.
    pub fn release_pools(&mut self) -> Result<()> {
        for pool in self.pools.drain(..) {
            self.allocator.free(pool.allocation, None)?;
        }
        self.stats = TileBlockStatistics::default();
        Ok(())
    }
}
