//! Texture descriptors and image information.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::format::ChannelFormat;
use crate::geometry::{self, MipLevelDims};

/// Identifier of a demand-loaded texture.
///
/// The id doubles as the page id of the texture's sampler.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TextureId(pub u32);

impl TextureId {
    /// Index form of the id.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Sampling parameters of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Address modes for u and v.
    pub address_mode: [vk::SamplerAddressMode; 2],
    /// Filter used within a mip level.
    pub filter_mode: vk::Filter,
    /// Filter used between mip levels.
    pub mipmap_filter_mode: vk::SamplerMipmapMode,
    /// Maximum anisotropy.
    pub max_anisotropy: u32,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            address_mode: [vk::SamplerAddressMode::CLAMP_TO_EDGE; 2],
            filter_mode: vk::Filter::LINEAR,
            mipmap_filter_mode: vk::SamplerMipmapMode::LINEAR,
            max_anisotropy: 16,
        }
    }
}

impl TextureDescriptor {
    /// Clamped, point-filtered descriptor. Sampling it is bit exact.
    pub fn point_clamp() -> Self {
        Self {
            address_mode: [vk::SamplerAddressMode::CLAMP_TO_EDGE; 2],
            filter_mode: vk::Filter::NEAREST,
            mipmap_filter_mode: vk::SamplerMipmapMode::NEAREST,
            max_anisotropy: 16,
        }
    }

    /// Set both address modes.
    pub fn with_address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_mode = [mode; 2];
        self
    }

    /// Set the filter modes.
    pub fn with_filter(mut self, filter: vk::Filter, mipmap: vk::SamplerMipmapMode) -> Self {
        self.filter_mode = filter;
        self.mipmap_filter_mode = mipmap;
        self
    }
}

/// Geometry and format of an image source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureInfo {
    /// Width of level 0 in texels.
    pub width: u32,
    /// Height of level 0 in texels.
    pub height: u32,
    /// Channel storage format.
    pub format: ChannelFormat,
    /// Number of channels per texel (1, 2 or 4).
    pub num_channels: u32,
    /// Number of mip levels provided by the source.
    pub num_mip_levels: u32,
    /// Set once the source has been opened successfully.
    pub is_valid: bool,
    /// Whether the source can serve individual tiles.
    pub is_tiled: bool,
}

impl TextureInfo {
    /// Size of one texel in bytes.
    #[inline]
    pub const fn pixel_size(&self) -> u32 {
        self.format.pixel_size(self.num_channels)
    }

    /// Dimensions of every mip level.
    pub fn mip_level_dims(&self) -> Vec<MipLevelDims> {
        geometry::mip_level_dims(self.width, self.height, self.num_mip_levels)
    }

    /// Size of the whole mip chain in bytes.
    pub fn total_size_bytes(&self) -> usize {
        geometry::chain_size_bytes(&self.mip_level_dims(), 0, self.pixel_size())
    }

    /// Whether the source provides more than one level.
    #[inline]
    pub const fn is_mipmapped(&self) -> bool {
        self.num_mip_levels > 1
    }
}
