//! Channel formats and texel decoding.

use glam::Vec4;
use half::f16;
use serde::{Deserialize, Serialize};

/// Storage format of a single texel channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelFormat {
    /// Unsigned 8-bit, normalized to [0, 1] when sampled.
    U8,
    /// Unsigned 16-bit, normalized to [0, 1] when sampled.
    U16,
    /// IEEE half float.
    F16,
    /// IEEE single float.
    #[default]
    F32,
}

impl ChannelFormat {
    /// Size of one channel in bytes.
    #[inline]
    pub const fn bytes_per_channel(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::F16 => 2,
            Self::F32 => 4,
        }
    }

    /// Size of one texel with `num_channels` channels.
    #[inline]
    pub const fn pixel_size(self, num_channels: u32) -> u32 {
        self.bytes_per_channel() * num_channels
    }

    /// Decode one channel from little-endian bytes.
    ///
    /// `bytes` must hold at least `bytes_per_channel()` bytes.
    pub fn decode_channel(self, bytes: &[u8]) -> f32 {
        match self {
            Self::U8 => f32::from(bytes[0]) / 255.0,
            Self::U16 => f32::from(u16::from_le_bytes([bytes[0], bytes[1]])) / 65535.0,
            Self::F16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
            Self::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Encode one channel value as little-endian bytes into `out`.
    pub fn encode_channel(self, value: f32, out: &mut [u8]) {
        match self {
            Self::U8 => out[0] = (value.clamp(0.0, 1.0) * 255.0).round() as u8,
            Self::U16 => {
                let v = (value.clamp(0.0, 1.0) * 65535.0).round() as u16;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Self::F16 => out[..2].copy_from_slice(&f16::from_f32(value).to_le_bytes()),
            Self::F32 => out[..4].copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Decode a texel with `num_channels` channels. Missing channels read as zero.
    pub fn decode_texel(self, num_channels: u32, bytes: &[u8]) -> Vec4 {
        let stride = self.bytes_per_channel() as usize;
        let mut texel = [0.0_f32; 4];
        for (c, value) in texel.iter_mut().enumerate().take(num_channels.min(4) as usize) {
            *value = self.decode_channel(&bytes[c * stride..]);
        }
        Vec4::from_array(texel)
    }

    /// Encode the first `num_channels` components of `texel` into `out`.
    pub fn encode_texel(self, num_channels: u32, texel: Vec4, out: &mut [u8]) {
        let stride = self.bytes_per_channel() as usize;
        for (c, value) in texel.to_array().into_iter().enumerate().take(num_channels.min(4) as usize) {
            self.encode_channel(value, &mut out[c * stride..]);
        }
    }
}
