//! Loader options.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_TILE_POOL_SIZE, TILE_SIZE_IN_BYTES};
use crate::error::{Error, Result};

/// Process-wide tunables of the demand loader.
///
/// Missing fields take their default when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Place textures whose whole mip chain fits in `small_texture_threshold` densely.
    pub use_small_texture_optimization: bool,
    /// Footprint in bytes at or below which a texture is considered small.
    pub small_texture_threshold: usize,
    /// Allow sparse placement at all.
    pub use_sparse_textures: bool,
    /// Number of texture ids (and sampler pages).
    pub max_textures: u32,
    /// Total number of pages in the page table, sampler pages included.
    pub max_pages: u32,
    /// Capacity of the per-launch miss buffer.
    pub max_requests_per_launch: usize,
    /// Tile pool size used when the device reports no recommended granularity.
    pub tile_pool_fallback_size: usize,
    /// Upper bound on tile pool memory in bytes (0 means the device budget only).
    pub max_tile_pool_memory: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            use_small_texture_optimization: true,
            small_texture_threshold: TILE_SIZE_IN_BYTES,
            use_sparse_textures: true,
            max_textures: 4096,
            max_pages: 1 << 22,
            max_requests_per_launch: 8192,
            tile_pool_fallback_size: DEFAULT_TILE_POOL_SIZE,
            max_tile_pool_memory: 0,
        }
    }
}

impl Options {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Enable or disable the small texture optimization.
    pub fn with_small_texture_optimization(mut self, enable: bool) -> Self {
        self.use_small_texture_optimization = enable;
        self
    }

    /// Enable or disable sparse placement.
    pub fn with_sparse_textures(mut self, enable: bool) -> Self {
        self.use_sparse_textures = enable;
        self
    }

    /// Set the number of texture ids.
    pub fn with_max_textures(mut self, max_textures: u32) -> Self {
        self.max_textures = max_textures;
        self
    }

    /// Set the miss buffer capacity.
    pub fn with_max_requests_per_launch(mut self, max_requests: usize) -> Self {
        self.max_requests_per_launch = max_requests;
        self
    }

    /// Set the tile pool fallback size.
    pub fn with_tile_pool_fallback_size(mut self, bytes: usize) -> Self {
        self.tile_pool_fallback_size = bytes;
        self
    }

    /// Cap the tile pool memory.
    pub fn with_max_tile_pool_memory(mut self, bytes: usize) -> Self {
        self.max_tile_pool_memory = bytes;
        self
    }

    /// Check that the options describe a usable loader.
    pub fn validate(&self) -> Result<()> {
        if self.max_textures > self.max_pages {
            return Err(Error::InvalidData(format!(
                "max_textures ({}) exceeds max_pages ({})",
                self.max_textures, self.max_pages
            )));
        }
        if self.max_requests_per_launch == 0 {
            return Err(Error::InvalidData("max_requests_per_launch must be positive".into()));
        }
        Ok(())
    }

    /// Footprint threshold that separates dense from sparse placement.
    pub fn dense_threshold(&self) -> usize {
        if self.use_small_texture_optimization {
            self.small_texture_threshold
        } else {
            0
        }
    }
}
