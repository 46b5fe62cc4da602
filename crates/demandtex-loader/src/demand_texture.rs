//! Per-texture placement and fill logic.
//!
//! A demand texture starts `Closed`. Opening it reads the image description;
//! initializing it decides once and for all whether the texture is backed
//! sparsely (tile by tile) or densely (whole mip chain resident), and
//! creates the device texture object.

use std::sync::Arc;

use demandtex_core::constants::TILE_SIZE_IN_BYTES;
use demandtex_core::geometry::{self, MipLevelDims};
use demandtex_core::{Options, TextureDescriptor, TextureId, TextureInfo, TileCoord};
use demandtex_gpu::{
    Allocation, CommandQueue, FillSource, GpuContext, ImageLayout, SparseProperties, SparseRegion,
    TextureObject,
};
use demandtex_image::ImageSource;
use glam::UVec2;

use crate::error::{Error, Result};

/// Lifecycle of a demand texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureState {
    /// Image source not opened yet.
    Closed,
    /// Image described; no device object yet.
    Open,
    /// Placement decided and device object created.
    Initialized,
}

/// Numbering of the tile and mip tail pages of a sparse texture.
///
/// Tiles come level by level in row-major order, followed by one page for
/// the mip tail when there is one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TexturePages {
    level_offsets: Vec<u32>,
    level_grids: Vec<UVec2>,
    mip_tail_page: Option<u32>,
    num_pages: u32,
}

impl TexturePages {
    /// Number the pages of a texture with `levels` and `properties`.
    pub fn new(levels: &[MipLevelDims], properties: &SparseProperties) -> Self {
        let tiled = (properties.mip_tail_first_level as usize).min(levels.len());
        let mut level_offsets = Vec::with_capacity(tiled);
        let mut level_grids = Vec::with_capacity(tiled);
        let mut num_pages = 0;
        for &dims in &levels[..tiled] {
            let grid = geometry::tile_grid(dims, properties.tile_dims);
            level_offsets.push(num_pages);
            level_grids.push(grid);
            num_pages += grid.x * grid.y;
        }

        let mip_tail_page = (tiled < levels.len()).then_some(num_pages);
        if mip_tail_page.is_some() {
            num_pages += 1;
        }

        Self {
            level_offsets,
            level_grids,
            mip_tail_page,
            num_pages,
        }
    }

    /// Total number of pages.
    pub const fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Relative page of a region.
    pub fn page_of(&self, region: SparseRegion) -> Option<u32> {
        match region {
            SparseRegion::MipTail => self.mip_tail_page,
            SparseRegion::Tile(coord) => {
                let grid = self.level_grids.get(coord.mip as usize)?;
                (coord.x < grid.x && coord.y < grid.y)
                    .then(|| self.level_offsets[coord.mip as usize] + coord.y * grid.x + coord.x)
            }
        }
    }

    /// Region of a relative page.
    pub fn target_of(&self, page: u32) -> Option<SparseRegion> {
        if Some(page) == self.mip_tail_page {
            return Some(SparseRegion::MipTail);
        }
        let level = self.level_offsets.partition_point(|&offset| offset <= page).checked_sub(1)?;
        let grid = self.level_grids[level];
        let index = page - self.level_offsets[level];
        (index < grid.x * grid.y).then(|| {
            SparseRegion::Tile(TileCoord::new(level as u32, index % grid.x, index / grid.x))
        })
    }
}

struct Placement {
    texture_object: TextureObject,
    sparse: Option<(SparseProperties, TexturePages)>,
    mip_tail_first_level: u32,
    mip_tail_size: usize,
}

/// A texture whose data is loaded on demand from an image source.
pub struct DemandTexture {
    id: TextureId,
    descriptor: TextureDescriptor,
    image: Arc<dyn ImageSource>,
    context: Arc<GpuContext>,
    state: TextureState,
    info: TextureInfo,
    levels: Vec<MipLevelDims>,
    placement: Option<Placement>,
}

impl DemandTexture {
    /// Create a closed texture.
    pub fn new(
        id: TextureId,
        descriptor: TextureDescriptor,
        image: Arc<dyn ImageSource>,
        context: Arc<GpuContext>,
    ) -> Self {
        Self {
            id,
            descriptor,
            image,
            context,
            state: TextureState::Closed,
            info: TextureInfo::default(),
            levels: Vec::new(),
            placement: None,
        }
    }

    /// Texture id.
    pub const fn id(&self) -> TextureId {
        self.id
    }

    /// Lifecycle state.
    pub const fn state(&self) -> TextureState {
        self.state
    }

    /// Sampling parameters.
    pub const fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// Image description; `is_valid` is false until opened.
    pub const fn info(&self) -> &TextureInfo {
        &self.info
    }

    /// Open the image source. Opening an open texture does nothing.
    pub fn open(&mut self) -> Result<()> {
        if self.state != TextureState::Closed {
            return Ok(());
        }

        let info = self
            .image
            .open()
            .map_err(|err| Error::UnsupportedFormat(format!("{}: {err}", self.id)))?;
        if !info.is_valid {
            return Err(Error::UnsupportedFormat(format!("{}: image source is not valid", self.id)));
        }
        if !matches!(info.num_channels, 1 | 2 | 4) || info.num_mip_levels == 0 {
            return Err(Error::UnsupportedFormat(format!(
                "{}: {} channels, {} levels",
                self.id, info.num_channels, info.num_mip_levels
            )));
        }

        self.levels = info.mip_level_dims();
        self.info = info;
        self.state = TextureState::Open;
        tracing::debug!(
            texture = %self.id,
            width = info.width,
            height = info.height,
            levels = info.num_mip_levels,
            "Opened texture"
        );
        Ok(())
    }

    /// Decide placement and create the device texture object.
    ///
    /// The texture is sparse only when the device supports sparse textures,
    /// sparse placement is enabled, the source is tiled and the mip chain is
    /// larger than the dense threshold. Initializing twice does nothing.
    pub fn init(&mut self, options: &Options) -> Result<()> {
        match self.state {
            TextureState::Closed => return Err(self.wrong_state("init")),
            TextureState::Initialized => return Ok(()),
            TextureState::Open => {}
        }

        let layout = ImageLayout::from_info(&self.info);
        let footprint = layout.chain_size();
        let use_sparse = self.context.capabilities().supports_sparse_textures
            && options.use_sparse_textures
            && self.info.is_tiled
            && geometry::tile_dimensions(layout.pixel_size()).is_some()
            && footprint > options.dense_threshold();

        let placement = if use_sparse {
            let (texture_object, properties) = self.context.create_sparse_texture(layout, self.descriptor)?;
            let pages = TexturePages::new(&self.levels, &properties);
            Placement {
                texture_object,
                mip_tail_first_level: properties.mip_tail_first_level,
                mip_tail_size: properties.mip_tail_size,
                sparse: Some((properties, pages)),
            }
        } else {
            Placement {
                texture_object: self.context.create_dense_texture(layout, self.descriptor)?,
                sparse: None,
                mip_tail_first_level: 0,
                mip_tail_size: footprint,
            }
        };

        tracing::debug!(texture = %self.id, sparse = use_sparse, footprint, "Initialized texture");
        self.placement = Some(placement);
        self.state = TextureState::Initialized;
        Ok(())
    }

    fn wrong_state(&self, operation: &str) -> Error {
        Error::InvalidState(format!("{operation} on {} in state {:?}", self.id, self.state))
    }

    fn placement(&self, operation: &str) -> Result<&Placement> {
        self.placement.as_ref().ok_or_else(|| self.wrong_state(operation))
    }

    fn sparse(&self, operation: &str) -> Result<(&Placement, &SparseProperties)> {
        let placement = self.placement(operation)?;
        match &placement.sparse {
            Some((properties, _)) => Ok((placement, properties)),
            None => Err(Error::InvalidState(format!("{operation} on dense {}", self.id))),
        }
    }

    fn dense(&self, operation: &str) -> Result<&Placement> {
        let placement = self.placement(operation)?;
        if placement.sparse.is_some() {
            return Err(Error::InvalidState(format!("{operation} on sparse {}", self.id)));
        }
        Ok(placement)
    }

    /// Read tile (`tile_x`, `tile_y`) of `mip_level` into `dst`.
    ///
    /// Returns `false` without writing when the tile lies outside the level's
    /// tile grid or in the mip tail.
    pub fn read_tile(&self, mip_level: u32, tile_x: u32, tile_y: u32, dst: &mut [u8]) -> Result<bool> {
        let (_, properties) = self.sparse("read_tile")?;
        if mip_level >= properties.mip_tail_first_level {
            return Ok(false);
        }
        let grid = geometry::tile_grid(self.levels[mip_level as usize], properties.tile_dims);
        if tile_x >= grid.x || tile_y >= grid.y {
            return Ok(false);
        }

        let tile = properties.tile_dims;
        Ok(self.image.read_tile(dst, mip_level, tile_x, tile_y, tile.x, tile.y)?)
    }

    /// Queue a copy of one tile into the backing store and bind it.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_tile(
        &self,
        queue: &CommandQueue,
        mip_level: u32,
        tile_x: u32,
        tile_y: u32,
        source: FillSource<'_>,
        dest: Allocation,
        dest_offset: usize,
    ) -> Result<()> {
        let (placement, _) = self.sparse("fill_tile")?;
        let region = SparseRegion::Tile(TileCoord::new(mip_level, tile_x, tile_y));
        tracing::trace!(texture = %self.id, mip_level, tile_x, tile_y, "Filling tile");
        self.context
            .enqueue_sparse_fill(queue, placement.texture_object, region, source, dest, dest_offset)?;
        Ok(())
    }

    /// Queue unbinding of one tile.
    pub fn unmap_tile(&self, queue: &CommandQueue, mip_level: u32, tile_x: u32, tile_y: u32) -> Result<()> {
        let (placement, _) = self.sparse("unmap_tile")?;
        let region = SparseRegion::Tile(TileCoord::new(mip_level, tile_x, tile_y));
        self.context
            .enqueue_sparse_unmap(queue, placement.texture_object, region)?;
        Ok(())
    }

    /// Read the levels from `mip_tail_first_level` on, back to back.
    ///
    /// For a dense texture this is the whole mip chain. Returns `false` when
    /// a sparse texture has no mip tail.
    pub fn read_mip_tail(&self, dst: &mut [u8]) -> Result<bool> {
        let placement = self.placement("read_mip_tail")?;
        if placement.mip_tail_first_level as usize >= self.levels.len() {
            return Ok(false);
        }
        Ok(self.image.read_mip_tail(
            dst,
            placement.mip_tail_first_level,
            &self.levels,
            self.info.pixel_size(),
        )?)
    }

    /// Queue a copy of the mip tail into the backing store and bind it.
    pub fn fill_mip_tail(
        &self,
        queue: &CommandQueue,
        source: FillSource<'_>,
        dest: Allocation,
        dest_offset: usize,
    ) -> Result<()> {
        let (placement, _) = self.sparse("fill_mip_tail")?;
        tracing::trace!(texture = %self.id, size = source.len(), "Filling mip tail");
        self.context.enqueue_sparse_fill(
            queue,
            placement.texture_object,
            SparseRegion::MipTail,
            source,
            dest,
            dest_offset,
        )?;
        Ok(())
    }

    /// Queue unbinding of the mip tail.
    pub fn unmap_mip_tail(&self, queue: &CommandQueue) -> Result<()> {
        let (placement, _) = self.sparse("unmap_mip_tail")?;
        self.context
            .enqueue_sparse_unmap(queue, placement.texture_object, SparseRegion::MipTail)?;
        Ok(())
    }

    /// Queue a copy of the whole mip chain into a dense texture.
    pub fn fill_dense_texture(&self, queue: &CommandQueue, source: FillSource<'_>, width: u32, height: u32) -> Result<()> {
        let placement = self.dense("fill_dense_texture")?;
        tracing::trace!(texture = %self.id, width, height, "Filling dense texture");
        self.context
            .enqueue_dense_fill(queue, placement.texture_object, source, width, height)?;
        Ok(())
    }

    /// Read level 0 in full.
    pub fn read_non_mip_mapped_data(&self, dst: &mut [u8]) -> Result<bool> {
        self.placement("read_non_mip_mapped_data")?;
        Ok(self.image.read_mip_level(dst, 0, self.info.width, self.info.height)?)
    }

    /// Device texture object, once initialized.
    pub fn texture_object(&self) -> Option<TextureObject> {
        self.placement.as_ref().map(|placement| placement.texture_object)
    }

    /// Extent of `mip_level`, once opened.
    pub fn mip_level_dims(&self, mip_level: u32) -> Option<MipLevelDims> {
        self.levels.get(mip_level as usize).copied()
    }

    /// Extents of all levels, once opened.
    pub fn levels(&self) -> &[MipLevelDims] {
        &self.levels
    }

    /// Mip tail size in bytes; the whole chain for dense textures.
    pub fn mip_tail_size(&self) -> usize {
        self.placement.as_ref().map_or(0, |placement| placement.mip_tail_size)
    }

    /// First level of the mip tail; 0 for dense textures.
    pub fn mip_tail_first_level(&self) -> u32 {
        self.placement.as_ref().map_or(0, |placement| placement.mip_tail_first_level)
    }

    /// Whether the texture is sparsely backed. False until initialized.
    pub fn use_sparse_texture(&self) -> bool {
        self.sparse_layout().is_some()
    }

    /// Tile properties and page numbering of a sparse texture.
    pub fn sparse_layout(&self) -> Option<(&SparseProperties, &TexturePages)> {
        let (properties, pages) = self.placement.as_ref()?.sparse.as_ref()?;
        Some((properties, pages))
    }

    /// Tile width in texels (0 for dense textures).
    pub fn tile_width(&self) -> u32 {
        self.sparse_layout().map_or(0, |(properties, _)| properties.tile_dims.x)
    }

    /// Tile height in texels (0 for dense textures).
    pub fn tile_height(&self) -> u32 {
        self.sparse_layout().map_or(0, |(properties, _)| properties.tile_dims.y)
    }

    /// Number of tile and mip tail pages (0 for dense textures).
    pub fn num_pages(&self) -> u32 {
        self.sparse_layout().map_or(0, |(_, pages)| pages.num_pages())
    }

    /// Region addressed by a relative page.
    pub fn page_to_target(&self, page: u32) -> Option<SparseRegion> {
        self.sparse_layout()?.1.target_of(page)
    }

    /// Relative page of a region.
    pub fn target_to_page(&self, region: SparseRegion) -> Option<u32> {
        self.sparse_layout()?.1.page_of(region)
    }

    /// Buffer size needed by [`Self::read_tile`].
    pub const fn tile_buffer_size() -> usize {
        TILE_SIZE_IN_BYTES
    }
}
