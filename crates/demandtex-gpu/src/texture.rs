//! Sparse and dense texture objects.
//!
//! A sparse texture has no storage of its own. Each tile of a tiled level and
//! the mip tail are bound to a range of a tile pool by queue-ordered fills;
//! lookups that touch an unbound region fail. A dense texture owns storage
//! for its whole mip chain, charged to the device budget.
//!
//! The context records which regions are bound where; the backend holds the
//! images and texels.

use std::sync::Arc;

use demandtex_core::constants::TILE_SIZE_IN_BYTES;
use demandtex_core::geometry::{self, MipLevelDims};
use demandtex_core::{ChannelFormat, TextureDescriptor, TextureInfo, TileCoord};
use glam::{UVec2, Vec2, Vec4};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::backend::Binding;
use crate::command::CommandQueue;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{Allocation, FillSource};
use crate::sampler::Footprint;

/// Handle of a texture object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureObject(u64);

impl TextureObject {
    pub(crate) const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw handle value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Storage format and level extents of a texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageLayout {
    /// Channel format
    pub format: ChannelFormat,
    /// Channels per texel
    pub num_channels: u32,
    /// Extent of every mip level
    pub levels: Vec<MipLevelDims>,
}

impl ImageLayout {
    /// Layout of an image source.
    pub fn from_info(info: &TextureInfo) -> Self {
        Self {
            format: info.format,
            num_channels: info.num_channels,
            levels: info.mip_level_dims(),
        }
    }

    /// Size of one texel in bytes.
    pub const fn pixel_size(&self) -> u32 {
        self.format.pixel_size(self.num_channels)
    }

    /// Size of the whole mip chain in bytes.
    pub fn chain_size(&self) -> usize {
        geometry::chain_size_bytes(&self.levels, 0, self.pixel_size())
    }
}

/// Tile geometry of a sparse texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseProperties {
    /// Texel extent of one tile
    pub tile_dims: UVec2,
    /// First level stored in the mip tail
    pub mip_tail_first_level: u32,
    /// Mip tail size in bytes, rounded up to whole tiles (0 without a tail)
    pub mip_tail_size: usize,
}

impl SparseProperties {
    /// Region holding texel (`x`, `y`) of `level`.
    pub const fn region_of(&self, level: u32, x: u32, y: u32) -> SparseRegion {
        if level >= self.mip_tail_first_level {
            SparseRegion::MipTail
        } else {
            SparseRegion::Tile(TileCoord::new(
                level,
                x / self.tile_dims.x,
                y / self.tile_dims.y,
            ))
        }
    }
}

/// A bindable part of a sparse texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SparseRegion {
    /// One tile of a tiled level.
    Tile(TileCoord),
    /// All levels from the first mip tail level on.
    MipTail,
}

/// Tile geometry of the standard 64 KiB block shape.
pub(crate) fn standard_sparse_properties(layout: &ImageLayout) -> Result<SparseProperties> {
    let pixel_size = layout.pixel_size();
    let tile_dims = geometry::tile_dimensions(pixel_size).ok_or_else(|| {
        GpuError::UnsupportedFeature(format!("no sparse tile shape for {pixel_size}-byte texels"))
    })?;
    let first = geometry::mip_tail_first_level(&layout.levels, tile_dims);
    let tail_bytes = geometry::chain_size_bytes(&layout.levels, first, pixel_size);

    Ok(SparseProperties {
        tile_dims,
        mip_tail_first_level: first,
        mip_tail_size: geometry::align_to_tile(tail_bytes),
    })
}

/// Host-side state of a texture object.
pub(crate) struct TextureRecord {
    pub(crate) descriptor: TextureDescriptor,
    pub(crate) layout: ImageLayout,
    /// `None` for dense textures.
    pub(crate) sparse: Option<SparseProperties>,
    bound: HashMap<SparseRegion, Binding>,
}

impl TextureRecord {
    fn properties(&self) -> Result<SparseProperties> {
        self.sparse
            .ok_or_else(|| GpuError::InvalidArgument("texture is not sparse".into()))
    }

    pub(crate) fn binding(&self, region: SparseRegion) -> Option<Binding> {
        self.bound.get(&region).copied()
    }

    /// Byte size of `region`, after checking that it exists.
    pub(crate) fn region_size(&self, region: SparseRegion) -> Result<usize> {
        let properties = self.properties()?;
        match region {
            SparseRegion::Tile(coord) => {
                if coord.mip >= properties.mip_tail_first_level {
                    return Err(GpuError::InvalidArgument(format!(
                        "level {} is part of the mip tail",
                        coord.mip
                    )));
                }
                let grid = geometry::tile_grid(self.layout.levels[coord.mip as usize], properties.tile_dims);
                if coord.x >= grid.x || coord.y >= grid.y {
                    return Err(GpuError::InvalidArgument(format!(
                        "tile ({}, {}) outside the {}x{} grid of level {}",
                        coord.x, coord.y, grid.x, grid.y, coord.mip
                    )));
                }
                Ok(TILE_SIZE_IN_BYTES)
            }
            SparseRegion::MipTail if properties.mip_tail_size == 0 => {
                Err(GpuError::InvalidArgument("texture has no mip tail".into()))
            }
            SparseRegion::MipTail => Ok(properties.mip_tail_size),
        }
    }

    /// Byte offset of a texel inside the region holding it.
    ///
    /// Tiles store rows of `tile_dims.x` texels. The mip tail and dense
    /// images store their levels back to back.
    pub(crate) fn texel_offset(&self, level: u32, x: u32, y: u32) -> usize {
        let pixel_size = self.layout.pixel_size() as usize;
        let first = match self.sparse {
            Some(sparse) if level < sparse.mip_tail_first_level => {
                let tile = sparse.tile_dims;
                let (lx, ly) = ((x % tile.x) as usize, (y % tile.y) as usize);
                return (ly * tile.x as usize + lx) * pixel_size;
            }
            Some(sparse) => sparse.mip_tail_first_level,
            None => 0,
        };
        let dims = self.layout.levels[level as usize];
        geometry::chain_level_offset(&self.layout.levels, first, level, self.layout.pixel_size())
            + (y as usize * dims.x as usize + x as usize) * pixel_size
    }
}

impl GpuContext {
    fn texture(&self, object: TextureObject) -> Result<Arc<RwLock<TextureRecord>>> {
        self.textures
            .read()
            .get(&object)
            .cloned()
            .ok_or(GpuError::InvalidTexture(object.0))
    }

    fn insert_texture(&self, object: TextureObject, record: TextureRecord) {
        self.textures.write().insert(object, Arc::new(RwLock::new(record)));
    }

    fn check_queue(&self, queue: &CommandQueue) -> Result<()> {
        if queue.context_id() == self.id() {
            Ok(())
        } else {
            Err(GpuError::InvalidArgument(format!(
                "queue {} belongs to {}",
                queue.name(),
                queue.context_id()
            )))
        }
    }

    fn check_extent(&self, layout: &ImageLayout) -> Result<()> {
        let max = self.capabilities().max_texture_dimension;
        match layout.levels.first() {
            None => Err(GpuError::InvalidArgument("texture has no levels".into())),
            Some(dims) if dims.x > max || dims.y > max => Err(GpuError::InvalidArgument(format!(
                "{}x{} exceeds the maximum extent of {max}",
                dims.x, dims.y
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Tile geometry a sparse texture with `layout` would have.
    pub fn sparse_properties(&self, layout: &ImageLayout) -> Result<SparseProperties> {
        if !self.capabilities().supports_sparse_textures {
            return Err(GpuError::UnsupportedFeature("sparse textures".into()));
        }
        self.backend().sparse_properties(layout)
    }

    /// Create a sparse texture object. No memory is bound.
    pub fn create_sparse_texture(
        &self,
        layout: ImageLayout,
        descriptor: TextureDescriptor,
    ) -> Result<(TextureObject, SparseProperties)> {
        self.check_extent(&layout)?;
        let properties = self.sparse_properties(&layout)?;

        let object = self.next_texture_object();
        self.backend().create_image(object, &layout, Some(&properties))?;
        self.insert_texture(
            object,
            TextureRecord {
                descriptor,
                layout,
                sparse: Some(properties),
                bound: HashMap::new(),
            },
        );
        tracing::debug!(
            texture = object.0,
            tile = ?properties.tile_dims,
            mip_tail_first_level = properties.mip_tail_first_level,
            "Created sparse texture"
        );
        Ok((object, properties))
    }

    /// Create a dense texture object with storage for its whole mip chain.
    pub fn create_dense_texture(&self, layout: ImageLayout, descriptor: TextureDescriptor) -> Result<TextureObject> {
        self.check_extent(&layout)?;
        let object = self.next_texture_object();
        self.backend().create_image(object, &layout, None)?;

        let size = layout.chain_size();
        self.insert_texture(
            object,
            TextureRecord {
                descriptor,
                layout,
                sparse: None,
                bound: HashMap::new(),
            },
        );
        tracing::debug!(texture = object.0, size, "Created dense texture");
        Ok(object)
    }

    /// Destroy a texture object. Bound tile pools are not released.
    pub fn destroy_texture(&self, object: TextureObject) -> Result<()> {
        let record = self
            .textures
            .write()
            .remove(&object)
            .ok_or(GpuError::InvalidTexture(object.0))?;
        let record = record.read();
        self.backend().destroy_image(object, &record)
    }

    /// Queue a copy of `source` into `dest` at `offset` and bind `region` there.
    ///
    /// Arguments are validated when the fill is issued. Failures of the copy
    /// itself surface at the next synchronization of `queue`.
    pub fn enqueue_sparse_fill(
        self: &Arc<Self>,
        queue: &CommandQueue,
        object: TextureObject,
        region: SparseRegion,
        source: FillSource<'_>,
        dest: Allocation,
        offset: usize,
    ) -> Result<()> {
        self.check_queue(queue)?;
        let texture = self.texture(object)?;
        let bound_size = texture.read().region_size(region)?;
        let handle = dest.as_handle().ok_or_else(|| {
            GpuError::InvalidArgument("sparse textures bind tile pool handles only".into())
        })?;
        if source.len() > bound_size {
            return Err(GpuError::InvalidArgument(format!(
                "{} source bytes exceed the {bound_size}-byte region",
                source.len()
            )));
        }

        let payload = source.stage();
        let context = Arc::clone(self);
        queue.submit("sparse_fill", move || {
            let bytes = payload.into_bytes(context.backend())?;
            let binding = Binding { handle, offset };
            let mut texture = texture.write();
            context
                .backend()
                .bind_region(object, &texture, region, binding, bound_size, &bytes)?;
            texture.bound.insert(region, binding);
            tracing::trace!(texture = object.0, ?region, "Bound sparse region");
            Ok(())
        });
        Ok(())
    }

    /// Queue unbinding of `region`.
    pub fn enqueue_sparse_unmap(
        self: &Arc<Self>,
        queue: &CommandQueue,
        object: TextureObject,
        region: SparseRegion,
    ) -> Result<()> {
        self.check_queue(queue)?;
        let texture = self.texture(object)?;
        texture.read().region_size(region)?;

        let context = Arc::clone(self);
        queue.submit("sparse_unmap", move || {
            let mut texture = texture.write();
            if texture.bound.remove(&region).is_some() {
                context.backend().unbind_region(object, &texture, region)?;
            }
            Ok(())
        });
        Ok(())
    }

    /// Queue a copy of a whole mip chain into a dense texture.
    ///
    /// `width` and `height` must match level 0 and `source` must hold the
    /// levels back to back.
    pub fn enqueue_dense_fill(
        self: &Arc<Self>,
        queue: &CommandQueue,
        object: TextureObject,
        source: FillSource<'_>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.check_queue(queue)?;
        let texture = self.texture(object)?;
        {
            let record = texture.read();
            if record.sparse.is_some() {
                return Err(GpuError::InvalidArgument("texture is not dense".into()));
            }
            if record.layout.levels[0] != UVec2::new(width, height) {
                return Err(GpuError::InvalidArgument(format!(
                    "{width}x{height} does not match level 0 extent {}",
                    record.layout.levels[0]
                )));
            }
            let chain = record.layout.chain_size();
            if source.len() > chain {
                return Err(GpuError::InvalidArgument(format!(
                    "{} source bytes exceed the {chain}-byte mip chain",
                    source.len()
                )));
            }
        }

        let payload = source.stage();
        let context = Arc::clone(self);
        queue.submit("dense_fill", move || {
            let bytes = payload.into_bytes(context.backend())?;
            let texture = texture.read();
            context.backend().write_image(object, &texture, &bytes)
        });
        Ok(())
    }

    /// Check whether `region` of a sparse texture is bound.
    pub fn is_region_bound(&self, object: TextureObject, region: SparseRegion) -> bool {
        self.texture(object)
            .is_ok_and(|texture| texture.read().bound.contains_key(&region))
    }

    /// Number of live texture objects.
    pub fn num_textures(&self) -> usize {
        self.textures.read().len()
    }

    /// Filtered lookup of `object` at `uv` and level of detail `lod`.
    ///
    /// Returns `None` when the footprint touches an unbound sparse region.
    pub fn sample(&self, object: TextureObject, uv: Vec2, lod: f32) -> Option<Vec4> {
        let Ok(texture) = self.texture(object) else {
            tracing::warn!(texture = object.0, "Sampled unknown texture object");
            return None;
        };
        let record = texture.read();
        let footprint = Footprint::compute(&record.descriptor, &record.layout.levels, uv, lod);
        let format = record.layout.format;
        let channels = record.layout.num_channels;
        let pixel_size = record.layout.pixel_size() as usize;

        let mut texel = [0u8; 16];
        footprint.combine(|tap| {
            let region = match record.sparse {
                Some(sparse) => {
                    let region = sparse.region_of(tap.level, tap.x, tap.y);
                    if !record.bound.contains_key(&region) {
                        return None;
                    }
                    Some(region)
                }
                None => None,
            };
            let out = &mut texel[..pixel_size];
            let offset = record.texel_offset(tap.level, tap.x, tap.y);
            if let Err(err) = self.backend().read_texel(object, &record, region, offset, out) {
                tracing::warn!(texture = object.0, "Texel fetch failed: {err}");
                return None;
            }
            Some(format.decode_texel(channels, out))
        })
    }
}
