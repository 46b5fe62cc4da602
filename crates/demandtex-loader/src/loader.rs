//! The per-frame request loop.
//!
//! Each frame the application calls [`DemandLoader::launch_prepare`], launches
//! its kernels with the prepared [`DeviceContext`], then calls
//! [`DemandLoader::process_requests`] and eventually waits on the returned
//! [`Ticket`] before relaunching.

use std::sync::Arc;

use demandtex_core::{Options, TextureDescriptor, TextureId};
use demandtex_gpu::{
    check_context, CommandQueue, FillSource, GpuContext, GpuError, SparseRegion, TextureTileAllocator,
};
use demandtex_image::ImageSource;
use hashbrown::HashMap;

use crate::deferred::DeferredBlockRelease;
use crate::demand_texture::{DemandTexture, TextureState};
use crate::device_context::{DeviceContext, LaunchState, ResidencyBits, SamplerRecord, SparseSampler};
use crate::error::{Error, Result};
use crate::page_table::{PageTableManager, ResolvedPage};
use crate::ticket::{Batch, Ticket};
use crate::tile_allocator::{TileBlockAllocator, TileBlockHandle, TileBlockStatistics};

/// Counters accumulated over the loader's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStatistics {
    /// Textures created
    pub num_textures: usize,
    /// Launches prepared
    pub num_launches: u64,
    /// Distinct pages serviced by `process_requests`
    pub num_requests_processed: u64,
    /// Distinct pages dropped because the miss buffer was full
    pub num_requests_dropped: u64,
    /// Pages forgotten again because the batch that filled them failed
    pub num_fills_failed: u64,
    /// Tiles filled
    pub num_tiles_filled: u64,
    /// Mip tails filled
    pub num_mip_tails_filled: u64,
    /// Dense textures filled
    pub num_dense_textures_filled: u64,
    /// Bytes copied into textures
    pub num_bytes_filled: u64,
    /// Tiles and mip tails unloaded
    pub num_tiles_unloaded: u64,
    /// Resident pages, sampler pages included
    pub num_resident_pages: usize,
    /// Backing store usage
    pub tile_blocks: TileBlockStatistics,
}

/// Pages made resident by one ticket's batch.
struct InFlight {
    batch: Arc<Batch>,
    pages: Vec<u32>,
}

/// Loads texture data on demand.
pub struct DemandLoader {
    context: Arc<GpuContext>,
    options: Options,
    textures: Vec<DemandTexture>,
    page_table: PageTableManager,
    resident: ResidencyBits,
    blocks: HashMap<u32, TileBlockHandle>,
    tile_allocator: TileBlockAllocator,
    deferred: DeferredBlockRelease,
    in_flight: Vec<InFlight>,
    stats: LoaderStatistics,
}

impl DemandLoader {
    /// Create a loader bound to `context`, which must be current.
    pub fn new(context: Arc<GpuContext>, options: Options) -> Result<Self> {
        check_context(context.id())?;
        options
            .validate()
            .map_err(|err| Error::InvalidOptions(err.to_string()))?;

        let page_table = PageTableManager::new(options.max_textures, options.max_pages)?;
        let tiles = TextureTileAllocator::new(Arc::clone(&context));
        let pool_size = tiles.recommended_allocation_size(options.tile_pool_fallback_size);
        let tile_allocator = TileBlockAllocator::new(tiles, pool_size, options.max_tile_pool_memory);

        tracing::info!(
            context = %context.id(),
            pool_size,
            max_textures = options.max_textures,
            "Created demand loader"
        );
        Ok(Self {
            context,
            options,
            textures: Vec::new(),
            page_table,
            resident: ResidencyBits::default(),
            blocks: HashMap::new(),
            tile_allocator,
            deferred: DeferredBlockRelease::new(),
            in_flight: Vec::new(),
            stats: LoaderStatistics::default(),
        })
    }

    /// Loader options.
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// The GPU context the loader is bound to.
    pub const fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    /// Register a texture. Nothing is read until a kernel first samples it.
    pub fn create_texture(&mut self, image: Arc<dyn ImageSource>, descriptor: TextureDescriptor) -> Result<TextureId> {
        let index = self.textures.len() as u32;
        if index >= self.options.max_textures {
            return Err(Error::PageTableFull {
                requested: 1,
                available: 0,
            });
        }

        let id = TextureId(index);
        self.textures
            .push(DemandTexture::new(id, descriptor, image, Arc::clone(&self.context)));
        self.stats.num_textures = self.textures.len();
        tracing::debug!(texture = %id, "Created texture");
        Ok(id)
    }

    /// Look up a texture.
    pub fn texture(&self, id: TextureId) -> Option<&DemandTexture> {
        self.textures.get(id.index())
    }

    fn check_queue(&self, queue: &CommandQueue) -> Result<()> {
        check_context(self.context.id())?;
        if queue.context_id() == self.context.id() {
            Ok(())
        } else {
            Err(Error::Gpu(GpuError::InvalidArgument(format!(
                "queue {} belongs to {}",
                queue.name(),
                queue.context_id()
            ))))
        }
    }

    /// Prepare `device_context` for the next launch.
    ///
    /// Snapshots the samplers and residency bits and gives the context an
    /// empty miss buffer. Blocks whose release has completed are reclaimed,
    /// and pages of batches whose ticket reported a failure are forgotten.
    pub fn launch_prepare(&mut self, queue: &CommandQueue, device_context: &mut DeviceContext) -> Result<()> {
        self.check_queue(queue)?;
        self.release_completed_blocks()?;
        self.settle_batches(false)?;

        let samplers = self
            .textures
            .iter()
            .map(|texture| self.sampler_record(texture))
            .collect();
        device_context.prepare(LaunchState::new(
            Arc::clone(&self.context),
            samplers,
            self.resident.clone(),
            self.options.max_requests_per_launch,
        ));
        self.stats.num_launches += 1;
        Ok(())
    }

    fn sampler_record(&self, texture: &DemandTexture) -> Option<SamplerRecord> {
        if texture.state() != TextureState::Initialized {
            return None;
        }
        let sparse = match texture.sparse_layout() {
            Some((properties, pages)) => Some(SparseSampler {
                properties: *properties,
                pages: pages.clone(),
                first_page: self.page_table.range_of(texture.id())?.first,
            }),
            None => None,
        };
        Some(SamplerRecord {
            texture_object: texture.texture_object()?,
            descriptor: *texture.descriptor(),
            levels: texture.levels().to_vec(),
            sparse,
        })
    }

    /// Service the misses recorded by the kernels launched with `device_context`.
    ///
    /// Waits for the kernels queued on `queue` before harvesting. Each
    /// distinct page is serviced once: sampler pages open and initialize
    /// their texture (filling dense textures entirely), tile and mip tail
    /// pages get a backing block and a fill. All fills are issued on `queue`.
    #[tracing::instrument(skip_all, fields(queue = queue.name()))]
    pub fn process_requests(&mut self, queue: &CommandQueue, device_context: &DeviceContext) -> Result<Ticket> {
        self.check_queue(queue)?;
        if !device_context.is_prepared() {
            return Err(Error::InvalidState("device context was not prepared for a launch".into()));
        }

        self.settle_batches(true)?;
        queue.record_event().wait()?;
        let Some((pages, dropped)) = device_context.take_misses() else {
            return Ok(Ticket::empty());
        };
        if dropped > 0 {
            tracing::warn!(
                capacity = self.options.max_requests_per_launch,
                dropped,
                "Miss buffer overflowed; dropped pages will be requested again"
            );
            self.stats.num_requests_dropped += dropped as u64;
        }

        let num_requests = pages.len();
        let mut filled = Vec::new();
        for page in pages {
            if self.resident.get(page) {
                continue;
            }
            let serviced = match self.page_table.resolve(page) {
                Some(ResolvedPage::Sampler(texture)) => self.service_sampler(queue, texture)?,
                Some(ResolvedPage::Texture {
                    texture,
                    relative_page,
                }) => self.service_page(queue, texture, page, relative_page)?,
                None => {
                    tracing::warn!(page, "Request for unassigned page");
                    false
                }
            };
            if serviced {
                filled.push(page);
            }
        }

        let num_tasks = filled.len();
        self.stats.num_requests_processed += num_tasks as u64;
        self.stats.num_resident_pages = self.resident.count();
        tracing::debug!(requests = num_requests, tasks = num_tasks, "Processed requests");

        if filled.is_empty() {
            return Ok(Ticket::empty());
        }
        let ticket = Ticket::new(vec![queue.record_event()], num_tasks);
        self.in_flight.push(InFlight {
            batch: ticket.batch(),
            pages: filled,
        });
        Ok(ticket)
    }

    /// Retire batches issued by earlier calls to `process_requests`.
    ///
    /// With `block` set every batch is waited on; otherwise only batches
    /// whose ticket was already waited on are looked at. A failed batch
    /// leaves its pages non-resident and returns their blocks, so the next
    /// launch requests them again. Returns the number of pages forgotten.
    fn settle_batches(&mut self, block: bool) -> Result<usize> {
        let mut forgotten = 0;
        for in_flight in std::mem::take(&mut self.in_flight) {
            let outcome = if block {
                Some(in_flight.batch.wait())
            } else {
                in_flight.batch.outcome()
            };
            match outcome {
                None => self.in_flight.push(in_flight),
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::warn!(pages = in_flight.pages.len(), "Fill batch failed: {err}");
                    for page in in_flight.pages {
                        self.resident.clear(page);
                        if let Some(block) = self.blocks.remove(&page) {
                            self.tile_allocator.free_tile_block(block)?;
                        }
                        forgotten += 1;
                    }
                }
            }
        }
        self.stats.num_fills_failed += forgotten as u64;
        Ok(forgotten)
    }

    /// Open and initialize a texture on its first sampler request.
    fn service_sampler(&mut self, queue: &CommandQueue, id: TextureId) -> Result<bool> {
        let texture = self
            .textures
            .get_mut(id.index())
            .ok_or(Error::UnknownTexture(id))?;
        texture.open()?;
        texture.init(&self.options)?;

        if texture.use_sparse_texture() {
            if self.page_table.range_of(id).is_none() {
                let range = self.page_table.reserve(id, texture.num_pages())?;
                tracing::debug!(texture = %id, first = range.first, count = range.count, "Reserved pages");
            }
        } else {
            let info = *texture.info();
            let mut data = vec![0u8; texture.mip_tail_size()];
            let read = if info.is_mipmapped() {
                texture.read_mip_tail(&mut data)?
            } else {
                texture.read_non_mip_mapped_data(&mut data)?
            };
            if !read {
                return Err(Error::UnsupportedFormat(format!("{id}: image data could not be read")));
            }
            self.stats.num_bytes_filled += data.len() as u64;
            texture.fill_dense_texture(queue, FillSource::Owned(data), info.width, info.height)?;
            self.stats.num_dense_textures_filled += 1;
        }

        self.resident.set(id.0);
        Ok(true)
    }

    /// Load one tile or mip tail page.
    fn service_page(&mut self, queue: &CommandQueue, id: TextureId, page: u32, relative_page: u32) -> Result<bool> {
        let texture = self.textures.get(id.index()).ok_or(Error::UnknownTexture(id))?;
        let Some(target) = texture.page_to_target(relative_page) else {
            tracing::warn!(texture = %id, relative_page, "Request for page outside texture");
            return Ok(false);
        };

        let size = match target {
            SparseRegion::Tile(_) => DemandTexture::tile_buffer_size(),
            SparseRegion::MipTail => texture.mip_tail_size(),
        };
        let block = self.tile_allocator.allocate_tile_block(size)?;
        let mut data = vec![0u8; size];

        let filled = match target {
            SparseRegion::Tile(coord) => texture
                .read_tile(coord.mip, coord.x, coord.y, &mut data)
                .and_then(|read| {
                    if read {
                        texture.fill_tile(
                            queue,
                            coord.mip,
                            coord.x,
                            coord.y,
                            FillSource::Owned(data),
                            block.allocation,
                            block.block.offset(),
                        )?;
                    }
                    Ok(read)
                }),
            SparseRegion::MipTail => texture.read_mip_tail(&mut data).and_then(|read| {
                if read {
                    texture.fill_mip_tail(queue, FillSource::Owned(data), block.allocation, block.block.offset())?;
                }
                Ok(read)
            }),
        };

        match filled {
            Ok(true) => {
                match target {
                    SparseRegion::Tile(_) => self.stats.num_tiles_filled += 1,
                    SparseRegion::MipTail => self.stats.num_mip_tails_filled += 1,
                }
                self.stats.num_bytes_filled += size as u64;
                self.blocks.insert(page, block);
                self.resident.set(page);
                Ok(true)
            }
            Ok(false) => {
                self.tile_allocator.free_tile_block(block)?;
                tracing::warn!(texture = %id, ?target, "Image source could not provide page");
                Ok(false)
            }
            Err(err) => {
                self.tile_allocator.free_tile_block(block)?;
                Err(err)
            }
        }
    }

    /// Unmap every resident tile and mip tail of a sparse texture.
    ///
    /// Residency is cleared immediately; the backing blocks are released once
    /// the unmaps queued on `queue` have completed. The texture stays
    /// initialized, so later misses reload its pages.
    pub fn unload_texture_tiles(&mut self, queue: &CommandQueue, id: TextureId) -> Result<usize> {
        self.check_queue(queue)?;
        let texture = self.textures.get(id.index()).ok_or(Error::UnknownTexture(id))?;
        let Some(range) = self.page_table.range_of(id) else {
            return Ok(0);
        };

        let mut released = Vec::new();
        for page in range.first..range.end() {
            if !self.resident.get(page) {
                continue;
            }
            match texture.page_to_target(page - range.first) {
                Some(SparseRegion::Tile(coord)) => texture.unmap_tile(queue, coord.mip, coord.x, coord.y)?,
                Some(SparseRegion::MipTail) => texture.unmap_mip_tail(queue)?,
                None => continue,
            }
            self.resident.clear(page);
            if let Some(block) = self.blocks.remove(&page) {
                released.push(block);
            }
        }

        if !released.is_empty() {
            let event = queue.record_event();
            for block in &released {
                self.deferred.queue(*block, event.clone());
            }
        }
        self.stats.num_tiles_unloaded += released.len() as u64;
        self.stats.num_resident_pages = self.resident.count();
        tracing::debug!(texture = %id, pages = released.len(), "Unloaded texture tiles");
        Ok(released.len())
    }

    /// Return blocks whose unmaps have completed to the allocator.
    pub fn release_completed_blocks(&mut self) -> Result<usize> {
        self.deferred.process(&mut self.tile_allocator)
    }

    /// Check whether `page` is resident.
    pub fn is_page_resident(&self, page: u32) -> bool {
        self.resident.get(page)
    }

    /// Accumulated statistics.
    pub fn statistics(&self) -> LoaderStatistics {
        LoaderStatistics {
            tile_blocks: self.tile_allocator.statistics(),
            num_resident_pages: self.resident.count(),
            ..self.stats
        }
    }
}

impl Drop for DemandLoader {
    fn drop(&mut self) {
        let result = self
            .deferred
            .flush(&mut self.tile_allocator)
            .and_then(|()| self.tile_allocator.release_pools());
        if let Err(err) = result {
            tracing::warn!("Failed to release tile pools: {err}");
        }
    }
}
