//! Images, sparse memory requirements and copy regions.

use ash::vk;
use demandtex_core::geometry;
use demandtex_core::{ChannelFormat, TileCoord};
use glam::UVec2;

use crate::error::{GpuError, Result};
use crate::texture::{ImageLayout, SparseProperties};

pub(crate) const IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::SAMPLED.as_raw()
        | vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
        | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Vulkan format of a texel layout.
pub(crate) const fn vk_format(format: ChannelFormat, num_channels: u32) -> Option<vk::Format> {
    let format = match (format, num_channels) {
        (ChannelFormat::U8, 1) => vk::Format::R8_UNORM,
        (ChannelFormat::U8, 2) => vk::Format::R8G8_UNORM,
        (ChannelFormat::U8, 4) => vk::Format::R8G8B8A8_UNORM,
        (ChannelFormat::U16, 1) => vk::Format::R16_UNORM,
        (ChannelFormat::U16, 2) => vk::Format::R16G16_UNORM,
        (ChannelFormat::U16, 4) => vk::Format::R16G16B16A16_UNORM,
        (ChannelFormat::F16, 1) => vk::Format::R16_SFLOAT,
        (ChannelFormat::F16, 2) => vk::Format::R16G16_SFLOAT,
        (ChannelFormat::F16, 4) => vk::Format::R16G16B16A16_SFLOAT,
        (ChannelFormat::F32, 1) => vk::Format::R32_SFLOAT,
        (ChannelFormat::F32, 2) => vk::Format::R32G32_SFLOAT,
        (ChannelFormat::F32, 4) => vk::Format::R32G32B32A32_SFLOAT,
        _ => return None,
    };
    Some(format)
}

pub(crate) fn format_of(layout: &ImageLayout) -> Result<vk::Format> {
    vk_format(layout.format, layout.num_channels).ok_or_else(|| {
        GpuError::UnsupportedFeature(format!(
            "no Vulkan format for {} {:?} channels",
            layout.num_channels, layout.format
        ))
    })
}

/// Create info for a 2D image holding `layout`.
pub(crate) fn image_create_info(layout: &ImageLayout, format: vk::Format, sparse: bool) -> vk::ImageCreateInfo<'static> {
    let flags = if sparse {
        vk::ImageCreateFlags::SPARSE_BINDING | vk::ImageCreateFlags::SPARSE_RESIDENCY
    } else {
        vk::ImageCreateFlags::empty()
    };
    let base = layout.levels.first().copied().unwrap_or(UVec2::ONE);
    vk::ImageCreateInfo::default()
        .flags(flags)
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: base.x,
            height: base.y,
            depth: 1,
        })
        .mip_levels(layout.levels.len() as u32)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(IMAGE_USAGE)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

/// Sparse layout of one image as the device reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SparseLayout {
    pub(crate) properties: SparseProperties,
    /// Opaque offset of the mip tail in the image's memory.
    pub(crate) mip_tail_offset: u64,
    /// Bytes the device binds for the mip tail.
    pub(crate) device_tail_size: u64,
}

/// Sparse blocks must have the standard 64 KiB shape, since tiles are
/// read and stored with that shape.
pub(crate) fn check_block_shape(granularity: vk::Extent3D, pixel_size: u32) -> Result<UVec2> {
    let tile = geometry::tile_dimensions(pixel_size).ok_or_else(|| {
        GpuError::UnsupportedFeature(format!("no sparse tile shape for {pixel_size}-byte texels"))
    })?;
    if granularity.width != tile.x || granularity.height != tile.y || granularity.depth != 1 {
        return Err(GpuError::UnsupportedFeature(format!(
            "device sparse block {}x{}x{} differs from the standard {}x{}",
            granularity.width, granularity.height, granularity.depth, tile.x, tile.y
        )));
    }
    Ok(tile)
}

/// Tile geometry from the device's mip tail report.
///
/// The tail holds the levels back to back from `first_lod`, so it takes at
/// least that many bytes even when the device binds less.
pub(crate) fn sparse_layout(
    layout: &ImageLayout,
    tile_dims: UVec2,
    first_lod: u32,
    tail_size: u64,
    tail_offset: u64,
) -> SparseLayout {
    let num_levels = layout.levels.len() as u32;
    let first = first_lod.min(num_levels);
    let mip_tail_size = if first < num_levels {
        let chain = geometry::chain_size_bytes(&layout.levels, first, layout.pixel_size());
        geometry::align_to_tile(chain).max(geometry::align_to_tile(tail_size as usize))
    } else {
        0
    };
    SparseLayout {
        properties: SparseProperties {
            tile_dims,
            mip_tail_first_level: first,
            mip_tail_size,
        },
        mip_tail_offset: tail_offset,
        device_tail_size: tail_size,
    }
}

/// Query the sparse layout of a sparse image.
///
/// # Safety
/// `image` must be a valid sparse image of `device`.
pub(crate) unsafe fn query_sparse_layout(device: &ash::Device, image: vk::Image, layout: &ImageLayout) -> Result<SparseLayout> {
    let requirements = unsafe { device.get_image_sparse_memory_requirements(image) };
    let color = requirements
        .iter()
        .find(|r| r.format_properties.aspect_mask.contains(vk::ImageAspectFlags::COLOR))
        .ok_or_else(|| GpuError::UnsupportedFeature("image has no sparse color aspect".into()))?;
    if color
        .format_properties
        .flags
        .contains(vk::SparseImageFormatFlags::NONSTANDARD_BLOCK_SIZE)
    {
        return Err(GpuError::UnsupportedFeature("non-standard sparse block size".into()));
    }
    let tile = check_block_shape(color.format_properties.image_granularity, layout.pixel_size())?;
    Ok(sparse_layout(
        layout,
        tile,
        color.image_mip_tail_first_lod,
        color.image_mip_tail_size,
        color.image_mip_tail_offset,
    ))
}

pub(crate) const fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Texel offset and extent of a tile, clipped to its level.
pub(crate) fn tile_extent(layout: &ImageLayout, tile_dims: UVec2, coord: TileCoord) -> (vk::Offset3D, vk::Extent3D) {
    let dims = layout.levels[coord.mip as usize];
    let origin = UVec2::new(coord.x * tile_dims.x, coord.y * tile_dims.y);
    let extent = tile_dims.min(dims.saturating_sub(origin));
    (
        vk::Offset3D {
            x: origin.x as i32,
            y: origin.y as i32,
            z: 0,
        },
        vk::Extent3D {
            width: extent.x,
            height: extent.y,
            depth: 1,
        },
    )
}

/// Copy of one tile stored as rows of `tile_dims.x` texels.
pub(crate) fn tile_copy(layout: &ImageLayout, tile_dims: UVec2, coord: TileCoord) -> vk::BufferImageCopy {
    let (offset, extent) = tile_extent(layout, tile_dims, coord);
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(tile_dims.x)
        .buffer_image_height(tile_dims.y)
        .image_subresource(color_layers(coord.mip))
        .image_offset(offset)
        .image_extent(extent)
}

/// Copies of levels `first..` stored back to back.
pub(crate) fn chain_copies(layout: &ImageLayout, first: u32) -> Vec<vk::BufferImageCopy> {
    let pixel_size = layout.pixel_size();
    (first..layout.levels.len() as u32)
        .map(|level| {
            let dims = layout.levels[level as usize];
            vk::BufferImageCopy::default()
                .buffer_offset(geometry::chain_level_offset(&layout.levels, first, level, pixel_size) as u64)
                .image_subresource(color_layers(level))
                .image_extent(vk::Extent3D {
                    width: dims.x,
                    height: dims.y,
                    depth: 1,
                })
        })
        .collect()
}
