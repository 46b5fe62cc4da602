//! The image source capability and source construction.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use demandtex_core::geometry::level_size_bytes;
use demandtex_core::{MipLevelDims, TextureInfo};

use crate::checkerboard::CheckerBoardImage;
use crate::error::{ImageSourceError, Result};
use crate::file::FileImage;
use crate::mandelbrot::MandelbrotImage;

/// File extensions served by [`FileImage`].
const FILE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "exr", "hdr", "tga", "bmp", "tif", "tiff"];

/// A source of texel data.
///
/// Reads write texels with the source's channel format, tightly packed.
/// Tiles are written with a row stride of `tile_width` texels; texels of an
/// edge tile that fall outside the level are left untouched.
pub trait ImageSource: Send + Sync {
    /// Open the source and describe it. Opening twice is harmless.
    fn open(&self) -> Result<TextureInfo>;

    /// Description of the source; `is_valid` is false until opened.
    fn info(&self) -> TextureInfo;

    /// Read one tile. Returns `false` when the tile lies outside the level.
    fn read_tile(
        &self,
        dst: &mut [u8],
        mip_level: u32,
        tile_x: u32,
        tile_y: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<bool>;

    /// Read a whole mip level of `width` x `height` texels.
    fn read_mip_level(&self, dst: &mut [u8], mip_level: u32, width: u32, height: u32) -> Result<bool>;

    /// Read levels `mip_tail_first_level..` back to back.
    fn read_mip_tail(
        &self,
        dst: &mut [u8],
        mip_tail_first_level: u32,
        levels: &[MipLevelDims],
        pixel_size: u32,
    ) -> Result<bool> {
        let mut offset = 0;
        for (level, &dims) in levels.iter().enumerate().skip(mip_tail_first_level as usize) {
            let size = level_size_bytes(dims, pixel_size);
            let Some(slice) = dst.get_mut(offset..offset + size) else {
                return Err(ImageSourceError::InvalidRequest(format!(
                    "mip tail does not fit in {} bytes",
                    dst.len()
                )));
            };
            if !self.read_mip_level(slice, level as u32, dims.x, dims.y)? {
                return Ok(false);
            }
            offset += size;
        }
        Ok(true)
    }

    /// Number of tiles read so far.
    fn num_tiles_read(&self) -> u64 {
        0
    }

    /// Number of bytes read so far.
    fn num_bytes_read(&self) -> u64 {
        0
    }
}

/// Read counters shared by the sources in this crate.
#[derive(Debug, Default)]
pub(crate) struct ReadCounters {
    tiles: AtomicU64,
    bytes: AtomicU64,
}

impl ReadCounters {
    pub(crate) fn record(&self, tiles: u64, bytes: usize) {
        self.tiles.fetch_add(tiles, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn tiles(&self) -> u64 {
        self.tiles.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Check that `dst` can hold `texels` texels of `pixel_size` bytes.
pub(crate) fn check_destination(dst: &[u8], texels: usize, pixel_size: u32) -> Result<()> {
    let needed = texels * pixel_size as usize;
    if dst.len() < needed {
        return Err(ImageSourceError::InvalidRequest(format!(
            "destination holds {} bytes, {needed} needed",
            dst.len()
        )));
    }
    Ok(())
}

/// Create an image source by name.
///
/// `"checkerboard"` and `"mandelbrot"` name 2048x2048 procedural images; any
/// other name is a file in `directory` whose extension selects the decoder.
pub fn create_image_source(name: &str, directory: impl AsRef<Path>) -> Result<Arc<dyn ImageSource>> {
    match name {
        "checkerboard" => return Ok(Arc::new(CheckerBoardImage::new(2048, 2048, 32, true, true))),
        "mandelbrot" => return Ok(Arc::new(MandelbrotImage::new(2048, 2048, 512))),
        _ => {}
    }

    let path = directory.as_ref().join(name);
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if FILE_EXTENSIONS.contains(&extension.as_str()) {
        Ok(Arc::new(FileImage::new(path)))
    } else {
        Err(ImageSourceError::UnsupportedFormat(format!("image file not supported: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_procedural_sources() {
        let source = create_image_source("checkerboard", "").unwrap();
        let info = source.open().unwrap();
        assert_eq!((info.width, info.height), (2048, 2048));
        assert_eq!(info.num_mip_levels, 12);

        let source = create_image_source("mandelbrot", "/nowhere").unwrap();
        assert!(!source.info().is_valid);
    }

    #[test]
    fn file_sources_by_extension() {
        assert!(create_image_source("level0.PNG", "textures").is_ok());
        assert!(create_image_source("tiled.exr", "textures").is_ok());
        assert!(matches!(
            create_image_source("model.obj", "textures"),
            Err(ImageSourceError::UnsupportedFormat(_))
        ));
        assert!(create_image_source("no_extension", "").is_err());
    }
}
