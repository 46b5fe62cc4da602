//! Image files decoded with the `image` crate.

use std::path::{Path, PathBuf};

use demandtex_core::geometry::{full_mip_level_count, level_size_bytes, mip_level_dims};
use demandtex_core::{ChannelFormat, MipLevelDims, TextureInfo};
use glam::UVec2;
use image::ColorType;
use parking_lot::RwLock;

use crate::error::{ImageSourceError, Result};
use crate::source::{check_destination, ImageSource, ReadCounters};

struct Decoded {
    info: TextureInfo,
    levels: Vec<MipLevelDims>,
    data: Vec<Vec<u8>>,
}

/// An image file, decoded in full when opened.
///
/// Float images (EXR, HDR) are served as four `F32` channels, everything else
/// as four `U8` channels. A full mip chain is built with a 2x2 box filter.
pub struct FileImage {
    path: PathBuf,
    decoded: RwLock<Option<Decoded>>,
    counters: ReadCounters,
}

impl FileImage {
    /// Create a source for the file at `path`. Nothing is read until opened.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            decoded: RwLock::new(None),
            counters: ReadCounters::default(),
        }
    }

    /// Path of the image file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(&self) -> Result<Decoded> {
        let image = image::open(&self.path)?;
        let (format, level0) = if matches!(image.color(), ColorType::Rgb32F | ColorType::Rgba32F) {
            let bytes = image
                .to_rgba32f()
                .into_raw()
                .into_iter()
                .flat_map(f32::to_le_bytes)
                .collect();
            (ChannelFormat::F32, bytes)
        } else {
            (ChannelFormat::U8, image.to_rgba8().into_raw())
        };

        let (width, height) = (image.width(), image.height());
        let num_mip_levels = full_mip_level_count(width, height);
        let levels = mip_level_dims(width, height, num_mip_levels);
        let mut data = vec![level0];
        for pair in levels.windows(2) {
            let next = downsample(format, data.last().map_or(&[][..], Vec::as_slice), pair[0], pair[1]);
            data.push(next);
        }

        tracing::debug!(path = %self.path.display(), width, height, ?format, "Decoded image file");
        Ok(Decoded {
            info: TextureInfo {
                width,
                height,
                format,
                num_channels: 4,
                num_mip_levels,
                is_valid: true,
                is_tiled: true,
            },
            levels,
            data,
        })
    }
}

/// Box filter `src` (extent `from`) down to extent `to`.
fn downsample(format: ChannelFormat, src: &[u8], from: UVec2, to: UVec2) -> Vec<u8> {
    let pixel_size = format.pixel_size(4) as usize;
    let mut dst = vec![0u8; level_size_bytes(to, format.pixel_size(4))];
    for y in 0..to.y {
        for x in 0..to.x {
            let mut sum = glam::Vec4::ZERO;
            let mut count = 0.0;
            for sy in (2 * y)..(2 * y + 2).min(from.y) {
                for sx in (2 * x)..(2 * x + 2).min(from.x) {
                    let start = (sy * from.x + sx) as usize * pixel_size;
                    sum += format.decode_texel(4, &src[start..start + pixel_size]);
                    count += 1.0;
                }
            }
            let start = (y * to.x + x) as usize * pixel_size;
            format.encode_texel(4, sum / count, &mut dst[start..start + pixel_size]);
        }
    }
    dst
}

impl ImageSource for FileImage {
    fn open(&self) -> Result<TextureInfo> {
        if let Some(decoded) = self.decoded.read().as_ref() {
            return Ok(decoded.info);
        }
        let decoded = self.decode()?;
        let info = decoded.info;
        *self.decoded.write() = Some(decoded);
        Ok(info)
    }

    fn info(&self) -> TextureInfo {
        self.decoded
            .read()
            .as_ref()
            .map(|decoded| decoded.info)
            .unwrap_or_default()
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
        let guard = self.decoded.read();
        let decoded = guard.as_ref().ok_or(ImageSourceError::NotOpen)?;
        let Some(&dims) = decoded.levels.get(mip_level as usize) else {
            return Ok(false);
        };
        let (x0, y0) = (tile_x * tile_width, tile_y * tile_height);
        if x0 >= dims.x || y0 >= dims.y {
            return Ok(false);
        }
        let pixel_size = decoded.info.pixel_size() as usize;
        check_destination(dst, tile_width as usize * tile_height as usize, decoded.info.pixel_size())?;

        let src = &decoded.data[mip_level as usize];
        let width = tile_width.min(dims.x - x0) as usize;
        let height = tile_height.min(dims.y - y0);
        for row in 0..height {
            let src_start = ((y0 + row) * dims.x + x0) as usize * pixel_size;
            let dst_start = (row * tile_width) as usize * pixel_size;
            dst[dst_start..dst_start + width * pixel_size]
                .copy_from_slice(&src[src_start..src_start + width * pixel_size]);
        }
        self.counters.record(1, width * height as usize * pixel_size);
        Ok(true)
    }

    fn read_mip_level(&self, dst: &mut [u8], mip_level: u32, width: u32, height: u32) -> Result<bool> {
        let guard = self.decoded.read();
        let decoded = guard.as_ref().ok_or(ImageSourceError::NotOpen)?;
        let Some(&dims) = decoded.levels.get(mip_level as usize) else {
            return Ok(false);
        };
        if dims != UVec2::new(width, height) {
            return Err(ImageSourceError::InvalidRequest(format!(
                "level {mip_level} is {}x{}, not {width}x{height}",
                dims.x, dims.y
            )));
        }
        let src = &decoded.data[mip_level as usize];
        check_destination(dst, width as usize * height as usize, decoded.info.pixel_size())?;
        dst[..src.len()].copy_from_slice(src);
        self.counters.record(0, src.len());
        Ok(true)
    }

    fn num_tiles_read(&self) -> u64 {
        self.counters.tiles()
    }

    fn num_bytes_read(&self) -> u64 {
        self.counters.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_png(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("demandtex-{}-{name}.png", std::process::id()));
        let image = image::RgbaImage::from_fn(8, 4, |x, y| image::Rgba([(x * 32) as u8, (y * 64) as u8, 0, 255]));
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn open_builds_mip_chain() {
        let path = write_test_png("chain");
        let source = FileImage::new(&path);
        assert!(!source.info().is_valid);

        let info = source.open().unwrap();
        assert!(info.is_valid);
        assert_eq!(info.format, ChannelFormat::U8);
        assert_eq!((info.width, info.height, info.num_mip_levels), (8, 4, 4));

        let mut level = vec![0u8; 4 * 2 * 4];
        assert!(source.read_mip_level(&mut level, 1, 4, 2).unwrap());
        // Average of red 0 and 32.
        assert_eq!(level[0], 16);
        assert_eq!(level[3], 255);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn edge_tile_is_partial() {
        let path = write_test_png("tile");
        let source = FileImage::new(&path);
        source.open().unwrap();

        let mut tile = vec![0xffu8; 4 * 4 * 4];
        assert!(source.read_tile(&mut tile, 0, 1, 0, 4, 4).unwrap());
        assert_eq!(tile[0], 128);
        assert!(!source.read_tile(&mut tile, 0, 2, 0, 4, 4).unwrap());
        assert_eq!(source.num_tiles_read(), 1);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_fails_to_open() {
        let source = FileImage::new("/definitely/not/here.png");
        assert!(source.open().is_err());
        assert!(matches!(
            source.read_tile(&mut [0u8; 16], 0, 0, 0, 1, 1),
            Err(ImageSourceError::NotOpen)
        ));
    }
}
