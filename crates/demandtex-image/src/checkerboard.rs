//! Procedural checkerboard.

use demandtex_core::MipLevelDims;
use glam::Vec4;

use crate::procedural::{Pattern, ProceduralImage};

/// Colour of the lit squares of each mip level, repeating after the last.
pub const LEVEL_COLORS: [Vec4; 7] = [
    Vec4::new(1.0, 0.0, 0.0, 0.0),
    Vec4::new(1.0, 0.5, 0.0, 0.0),
    Vec4::new(1.0, 1.0, 0.0, 0.0),
    Vec4::new(0.0, 1.0, 0.0, 0.0),
    Vec4::new(0.0, 1.0, 1.0, 0.0),
    Vec4::new(0.0, 0.0, 1.0, 0.0),
    Vec4::new(1.0, 0.0, 1.0, 0.0),
];

/// Checkerboard with the same number of squares per side on every level.
///
/// Squares whose indices sum to an even number take the level colour, the
/// others are black.
#[derive(Clone, Copy, Debug)]
pub struct Checkerboard {
    squares_per_side: u32,
}

impl Checkerboard {
    /// Checkerboard with `squares_per_side` squares along each axis.
    pub const fn new(squares_per_side: u32) -> Self {
        Self {
            squares_per_side: if squares_per_side == 0 { 1 } else { squares_per_side },
        }
    }

    /// Colour of lit squares on `level`.
    pub const fn level_color(level: u32) -> Vec4 {
        LEVEL_COLORS[level as usize % LEVEL_COLORS.len()]
    }

    /// Whether texel (`x`, `y`) of a level with extent `dims` is lit.
    pub fn is_lit(&self, dims: MipLevelDims, x: u32, y: u32) -> bool {
        let squares = u64::from(self.squares_per_side);
        let sx = u64::from(x) * squares / u64::from(dims.x);
        let sy = u64::from(y) * squares / u64::from(dims.y);
        (sx + sy) % 2 == 0
    }
}

impl Pattern for Checkerboard {
    fn texel(&self, level: u32, dims: MipLevelDims, x: u32, y: u32) -> Vec4 {
        if self.is_lit(dims, x, y) {
            Self::level_color(level)
        } else {
            Vec4::ZERO
        }
    }
}

/// Procedural RGBA float checkerboard image.
pub type CheckerBoardImage = ProceduralImage<Checkerboard>;

impl CheckerBoardImage {
    /// Create a checkerboard of `width` x `height` texels.
    pub fn new(width: u32, height: u32, squares_per_side: u32, use_mipmaps: bool, tiled: bool) -> Self {
        Self::with_pattern(
            width,
            height,
            use_mipmaps,
            tiled,
            Checkerboard::new(squares_per_side),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImageSourceError;
    use crate::source::ImageSource;
    use demandtex_core::geometry::{chain_size_bytes, level_size_bytes};
    use demandtex_core::ChannelFormat;
    use glam::UVec2;

    fn texel_at(bytes: &[u8], index: usize) -> Vec4 {
        ChannelFormat::F32.decode_texel(4, &bytes[index * 16..])
    }

    #[test]
    fn read_before_open_fails() {
        let image = CheckerBoardImage::new(256, 256, 4, true, true);
        let mut tile = vec![0u8; 64 * 64 * 16];
        assert!(matches!(image.read_tile(&mut tile, 0, 0, 0, 64, 64), Err(ImageSourceError::NotOpen)));
        assert!(!image.info().is_valid);
    }

    #[test]
    fn info_after_open() {
        let image = CheckerBoardImage::new(256, 256, 4, true, true);
        let info = image.open().unwrap();
        assert!(info.is_valid);
        assert!(info.is_tiled);
        assert_eq!(info.num_mip_levels, 9);
        assert_eq!(info.pixel_size(), 16);

        let flat = CheckerBoardImage::new(256, 256, 4, false, false);
        let info = flat.open().unwrap();
        assert_eq!(info.num_mip_levels, 1);
        assert!(!info.is_tiled);
    }

    #[test]
    fn corner_tiles() {
        let image = CheckerBoardImage::new(256, 256, 4, true, true);
        image.open().unwrap();
        let mut tile = vec![0u8; 64 * 64 * 16];

        assert!(image.read_tile(&mut tile, 0, 0, 0, 64, 64).unwrap());
        assert_eq!(texel_at(&tile, 32 * 64 + 32), Vec4::new(1.0, 0.0, 0.0, 0.0));

        assert!(image.read_tile(&mut tile, 0, 3, 0, 64, 64).unwrap());
        assert_eq!(texel_at(&tile, 32 * 64 + 32), Vec4::ZERO);

        assert!(!image.read_tile(&mut tile, 0, 4, 0, 64, 64).unwrap());
        assert!(!image.read_tile(&mut tile, 9, 0, 0, 64, 64).unwrap());
        assert_eq!(image.num_tiles_read(), 2);
    }

    #[test]
    fn levels_change_colour() {
        let image = CheckerBoardImage::new(256, 256, 4, true, true);
        image.open().unwrap();
        let mut level = vec![0u8; 32 * 32 * 16];
        assert!(image.read_mip_level(&mut level, 3, 32, 32).unwrap());
        assert_eq!(texel_at(&level, 0), Vec4::new(0.0, 1.0, 0.0, 0.0));
        assert_eq!(texel_at(&level, 8), Vec4::ZERO);
        assert!(image.read_mip_level(&mut level, 3, 16, 16).is_err());
    }

    #[test]
    fn mip_tail_concatenates_levels() {
        let image = CheckerBoardImage::new(256, 256, 4, true, true);
        let info = image.open().unwrap();
        let levels = info.mip_level_dims();
        let mut tail = vec![0u8; chain_size_bytes(&levels, 3, 16)];
        assert!(image.read_mip_tail(&mut tail, 3, &levels, 16).unwrap());

        let level4 = level_size_bytes(UVec2::new(32, 32), 16);
        assert_eq!(texel_at(&tail[level4..], 0), Checkerboard::level_color(4));

        let mut short = vec![0u8; 16];
        assert!(image.read_mip_tail(&mut short, 3, &levels, 16).is_err());
    }
}
