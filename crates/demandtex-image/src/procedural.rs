//! Images computed texel by texel.

use std::sync::atomic::{AtomicBool, Ordering};

use demandtex_core::geometry::{full_mip_level_count, mip_level_dims};
use demandtex_core::{ChannelFormat, MipLevelDims, TextureInfo};
use glam::Vec4;

use crate::error::{ImageSourceError, Result};
use crate::source::{check_destination, ImageSource, ReadCounters};

/// Texel generator of a procedural image.
pub trait Pattern: Send + Sync {
    /// Colour of texel (`x`, `y`) of `level`, whose extent is `dims`.
    fn texel(&self, level: u32, dims: MipLevelDims, x: u32, y: u32) -> Vec4;
}

/// An RGBA float image whose texels come from a [`Pattern`].
pub struct ProceduralImage<P> {
    info: TextureInfo,
    levels: Vec<MipLevelDims>,
    opened: AtomicBool,
    counters: ReadCounters,
    pattern: P,
}

impl<P: Pattern> ProceduralImage<P> {
    /// Create an image of `width` x `height` texels.
    ///
    /// With `use_mipmaps` the image has a full mip chain, otherwise one level.
    /// `tiled` controls whether the image advertises tile reads.
    pub fn with_pattern(width: u32, height: u32, use_mipmaps: bool, tiled: bool, pattern: P) -> Self {
        let num_mip_levels = if use_mipmaps { full_mip_level_count(width, height) } else { 1 };
        let info = TextureInfo {
            width,
            height,
            format: ChannelFormat::F32,
            num_channels: 4,
            num_mip_levels,
            is_valid: false,
            is_tiled: tiled,
        };
        Self {
            levels: mip_level_dims(width, height, num_mip_levels),
            info,
            opened: AtomicBool::new(false),
            counters: ReadCounters::default(),
            pattern,
        }
    }

    /// The texel generator.
    pub fn pattern(&self) -> &P {
        &self.pattern
    }

    fn level(&self, mip_level: u32) -> Result<Option<MipLevelDims>> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(ImageSourceError::NotOpen);
        }
        Ok(self.levels.get(mip_level as usize).copied())
    }

    fn write_texel(dst: &mut [u8], index: usize, texel: Vec4) {
        let start = index * 16;
        ChannelFormat::F32.encode_texel(4, texel, &mut dst[start..start + 16]);
    }
}

impl<P: Pattern> ImageSource for ProceduralImage<P> {
    fn open(&self) -> Result<TextureInfo> {
        self.opened.store(true, Ordering::Release);
        Ok(self.info())
    }

    fn info(&self) -> TextureInfo {
        TextureInfo {
            is_valid: self.opened.load(Ordering::Acquire),
            ..self.info
        }
    }

    fn read_tile(
        &self,
        dst: &mut [u8],
        mip_level: u32,
        tile_x: u32,
        tile_y: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<bool> {
        let Some(dims) = self.level(mip_level)? else {
            return Ok(false);
        };
        let (x0, y0) = (tile_x * tile_width, tile_y * tile_height);
        if x0 >= dims.x || y0 >= dims.y {
            return Ok(false);
        }
        check_destination(dst, tile_width as usize * tile_height as usize, 16)?;

        let width = tile_width.min(dims.x - x0);
        let height = tile_height.min(dims.y - y0);
        for row in 0..height {
            for col in 0..width {
                let texel = self.pattern.texel(mip_level, dims, x0 + col, y0 + row);
                Self::write_texel(dst, (row * tile_width + col) as usize, texel);
            }
        }
        self.counters.record(1, width as usize * height as usize * 16);
        Ok(true)
    }

    fn read_mip_level(&self, dst: &mut [u8], mip_level: u32, width: u32, height: u32) -> Result<bool> {
        let Some(dims) = self.level(mip_level)? else {
            return Ok(false);
        };
        if dims.x != width || dims.y != height {
            return Err(ImageSourceError::InvalidRequest(format!(
                "level {mip_level} is {}x{}, not {width}x{height}",
                dims.x, dims.y
            )));
        }
        check_destination(dst, width as usize * height as usize, 16)?;

        for y in 0..height {
            for x in 0..width {
                Self::write_texel(dst, (y * width + x) as usize, self.pattern.texel(mip_level, dims, x, y));
            }
        }
        self.counters.record(0, width as usize * height as usize * 16);
        Ok(true)
    }

    fn num_tiles_read(&self) -> u64 {
        self.counters.tiles()
    }

    fn num_bytes_read(&self) -> u64 {
        self.counters.bytes()
    }
}
