//! Mip chain and sparse tile geometry.

use glam::UVec2;

use crate::constants::TILE_SIZE_IN_BYTES;

/// Pixel dimensions of one mip level (x = width, y = height).
pub type MipLevelDims = UVec2;

/// Coordinates of a tile within a mip level's tile grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TileCoord {
    /// Mip level
    pub mip: u32,
    /// Tile column
    pub x: u32,
    /// Tile row
    pub y: u32,
}

impl TileCoord {
    /// Create a new tile coordinate.
    #[inline]
    pub const fn new(mip: u32, x: u32, y: u32) -> Self {
        Self { mip, x, y }
    }
}

/// Number of levels in a full mip chain for a `width` x `height` image.
pub fn full_mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Dimensions of every level in a chain of `num_levels` levels.
pub fn mip_level_dims(width: u32, height: u32, num_levels: u32) -> Vec<MipLevelDims> {
    (0..num_levels)
        .map(|level| UVec2::new((width >> level).max(1), (height >> level).max(1)))
        .collect()
}

/// Size in bytes of one level with the given texel size.
#[inline]
pub fn level_size_bytes(dims: MipLevelDims, pixel_size: u32) -> usize {
    dims.x as usize * dims.y as usize * pixel_size as usize
}

/// Size in bytes of the levels `dims[first..]` laid out back to back.
pub fn chain_size_bytes(dims: &[MipLevelDims], first: u32, pixel_size: u32) -> usize {
    dims.iter()
        .skip(first as usize)
        .map(|&d| level_size_bytes(d, pixel_size))
        .sum()
}

/// Byte offset of `level` inside a chain that starts at `first`.
pub fn chain_level_offset(dims: &[MipLevelDims], first: u32, level: u32, pixel_size: u32) -> usize {
    dims[first as usize..level as usize]
        .iter()
        .map(|&d| level_size_bytes(d, pixel_size))
        .sum()
}

/// Texel dimensions of a 64 KiB sparse tile for the given texel size.
///
/// Returns `None` for texel sizes that have no standard sparse tile shape
/// (e.g. three-channel formats).
pub const fn tile_dimensions(pixel_size: u32) -> Option<UVec2> {
    match pixel_size {
        1 => Some(UVec2::new(256, 256)),
        2 => Some(UVec2::new(256, 128)),
        4 => Some(UVec2::new(128, 128)),
        8 => Some(UVec2::new(128, 64)),
        16 => Some(UVec2::new(64, 64)),
        _ => None,
    }
}

/// First level whose extent is smaller than a tile in either dimension.
///
/// Equals `dims.len()` when every level can be tiled.
pub fn mip_tail_first_level(dims: &[MipLevelDims], tile: UVec2) -> u32 {
    dims.iter()
        .position(|d| d.x < tile.x || d.y < tile.y)
        .unwrap_or(dims.len()) as u32
}

/// Size of the tile grid covering a level.
#[inline]
pub fn tile_grid(dims: MipLevelDims, tile: UVec2) -> UVec2 {
    UVec2::new(dims.x.div_ceil(tile.x), dims.y.div_ceil(tile.y))
}

/// Round `value` up to a multiple of `align`.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Round `value` up to a whole number of tiles.
#[inline]
pub const fn align_to_tile(value: usize) -> usize {
    align_up(value, TILE_SIZE_IN_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_of_256() {
        assert_eq!(full_mip_level_count(256, 256), 9);
        assert_eq!(full_mip_level_count(256, 64), 9);
        assert_eq!(full_mip_level_count(1, 1), 1);

        let dims = mip_level_dims(256, 64, 9);
        assert_eq!(dims[0], UVec2::new(256, 64));
        assert_eq!(dims[6], UVec2::new(4, 1));
        assert_eq!(dims[8], UVec2::new(1, 1));
    }

    #[test]
    fn float4_tiles_are_64_texels() {
        let tile = tile_dimensions(16).unwrap();
        assert_eq!(tile, UVec2::new(64, 64));
        assert_eq!((tile.x * tile.y * 16) as usize, TILE_SIZE_IN_BYTES);
        assert!(tile_dimensions(12).is_none());
    }

    #[test]
    fn mip_tail_of_256_float4() {
        let dims = mip_level_dims(256, 256, 9);
        let tile = tile_dimensions(16).unwrap();
        assert_eq!(mip_tail_first_level(&dims, tile), 3);
        // 32^2 + 16^2 + 8^2 + 4^2 + 2^2 + 1 texels
        assert_eq!(chain_size_bytes(&dims, 3, 16), 1365 * 16);
        assert_eq!(chain_level_offset(&dims, 3, 5, 16), (1024 + 256) * 16);
    }

    #[test]
    fn tile_grid_rounds_up() {
        let tile = UVec2::new(64, 64);
        assert_eq!(tile_grid(UVec2::new(256, 256), tile), UVec2::new(4, 4));
        assert_eq!(tile_grid(UVec2::new(100, 65), tile), UVec2::new(2, 2));
    }

    #[test]
    fn alignment() {
        assert_eq!(align_to_tile(1), TILE_SIZE_IN_BYTES);
        assert_eq!(align_to_tile(TILE_SIZE_IN_BYTES), TILE_SIZE_IN_BYTES);
        assert_eq!(align_to_tile(TILE_SIZE_IN_BYTES + 1), 2 * TILE_SIZE_IN_BYTES);
        assert_eq!(align_up(0, 256), 0);
    }
}
