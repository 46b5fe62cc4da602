//! Core types, geometry and options for demand-loaded textures.
//!
//! This crate provides the foundational types shared by the device model,
//! the image sources and the loader:
//! - Texture descriptors and image information
//! - Channel formats and texel decoding
//! - Mip chain and sparse tile geometry
//! - Loader options and the core error type

pub mod config;
pub mod error;
pub mod format;
pub mod geometry;
pub mod types;

pub use config::Options;
pub use error::{Error, Result};
pub use format::ChannelFormat;
pub use geometry::{MipLevelDims, TileCoord};
pub use types::{TextureDescriptor, TextureId, TextureInfo};

/// Library-wide constants
pub mod constants {
    /// Size of one sparse tile in bytes.
    pub const TILE_SIZE_IN_BYTES: usize = 64 * 1024;
    /// Maximum number of mip levels in a texture (covers 32768 texels per side).
    pub const MAX_MIP_LEVELS: usize = 16;
    /// Tile pool size used when the device reports no recommended granularity.
    pub const DEFAULT_TILE_POOL_SIZE: usize = 8 << 20;
    /// Value written by sampling kernels for texels that are not resident.
    pub const NON_RESIDENT_SENTINEL: f32 = -1.0;
}
