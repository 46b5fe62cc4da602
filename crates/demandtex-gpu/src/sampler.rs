//! Texture sampling footprints.
//!
//! A footprint lists the texels (taps) a filtered lookup reads, with their
//! weights. The device sampler combines the taps of a footprint, and the
//! demand loader uses the same footprint to decide which pages a lookup needs.

use ash::vk;
use demandtex_core::{MipLevelDims, TextureDescriptor};
use glam::{Vec2, Vec4};

/// One texel read by a lookup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tap {
    /// Mip level
    pub level: u32,
    /// Texel column
    pub x: u32,
    /// Texel row
    pub y: u32,
    /// Filter weight
    pub weight: f32,
}

/// Texels read by one lookup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Footprint {
    /// Taps with non-zero weight.
    pub taps: Vec<Tap>,
    /// Weight that falls on the (transparent black) border colour.
    pub border_weight: f32,
}

impl Footprint {
    /// Compute the footprint of a lookup at `uv` and level of detail `lod`.
    ///
    /// Anisotropic filtering is not modelled.
    pub fn compute(desc: &TextureDescriptor, levels: &[MipLevelDims], uv: Vec2, lod: f32) -> Self {
        let mut footprint = Self::default();
        if levels.is_empty() {
            return footprint;
        }

        let max_level = (levels.len() - 1) as f32;
        let lod = if lod.is_nan() { 0.0 } else { lod.clamp(0.0, max_level) };

        if desc.mipmap_filter_mode == vk::SamplerMipmapMode::LINEAR {
            let lower = lod.floor();
            let blend = lod - lower;
            footprint.add_level(desc, levels, lower as u32, uv, 1.0 - blend);
            if blend > 0.0 {
                footprint.add_level(desc, levels, lower as u32 + 1, uv, blend);
            }
        } else {
            footprint.add_level(desc, levels, lod.round() as u32, uv, 1.0);
        }
        footprint
    }

    fn add_level(&mut self, desc: &TextureDescriptor, levels: &[MipLevelDims], level: u32, uv: Vec2, weight: f32) {
        let dims = levels[level as usize];
        let texel = uv * dims.as_vec2();

        if desc.filter_mode == vk::Filter::NEAREST {
            let x = texel.x.floor() as i64;
            let y = texel.y.floor() as i64;
            self.add_tap(desc, dims, level, x, y, weight);
            return;
        }

        let base = texel - Vec2::splat(0.5);
        let origin = base.floor();
        let frac = base - origin;
        let (x0, y0) = (origin.x as i64, origin.y as i64);

        let wx = [1.0 - frac.x, frac.x];
        let wy = [1.0 - frac.y, frac.y];
        for (dy, wy) in wy.into_iter().enumerate() {
            for (dx, wx) in wx.into_iter().enumerate() {
                self.add_tap(desc, dims, level, x0 + dx as i64, y0 + dy as i64, weight * wx * wy);
            }
        }
    }

    fn add_tap(&mut self, desc: &TextureDescriptor, dims: MipLevelDims, level: u32, x: i64, y: i64, weight: f32) {
        if weight <= 0.0 {
            return;
        }
        match (
            wrap(x, dims.x, desc.address_mode[0]),
            wrap(y, dims.y, desc.address_mode[1]),
        ) {
            (Some(x), Some(y)) => self.taps.push(Tap { level, x, y, weight }),
            _ => self.border_weight += weight,
        }
    }

    /// Combine the taps, fetching each texel with `fetch`.
    ///
    /// Returns `None` as soon as a fetch does.
    pub fn combine(&self, mut fetch: impl FnMut(&Tap) -> Option<Vec4>) -> Option<Vec4> {
        self.taps
            .iter()
            .try_fold(Vec4::ZERO, |sum, tap| Some(sum + fetch(tap)? * tap.weight))
    }
}

/// Apply an address mode to an integer texel coordinate.
///
/// Returns `None` when the coordinate falls on the border.
pub fn wrap(coord: i64, size: u32, mode: vk::SamplerAddressMode) -> Option<u32> {
    let size = i64::from(size.max(1));
    let wrapped = match mode {
        vk::SamplerAddressMode::REPEAT => coord.rem_euclid(size),
        vk::SamplerAddressMode::MIRRORED_REPEAT => {
            let m = coord.rem_euclid(2 * size);
            if m < size { m } else { 2 * size - 1 - m }
        }
        vk::SamplerAddressMode::CLAMP_TO_BORDER => {
            if (0..size).contains(&coord) {
                coord
            } else {
                return None;
            }
        }
        vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE => {
            let mirrored = if coord < 0 { -1 - coord } else { coord };
            mirrored.clamp(0, size - 1)
        }
        _ => coord.clamp(0, size - 1),
    };
    Some(wrapped as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use demandtex_core::geometry::mip_level_dims;

    #[test]
    fn point_sample_reads_one_texel() {
        let levels = mip_level_dims(256, 256, 9);
        let desc = TextureDescriptor::point_clamp();
        let footprint = Footprint::compute(&desc, &levels, Vec2::new(0.5, 0.25), 0.0);
        assert_eq!(footprint.taps, vec![Tap { level: 0, x: 128, y: 64, weight: 1.0 }]);

        let footprint = Footprint::compute(&desc, &levels, Vec2::new(1.0, 1.0), 2.4);
        assert_eq!(footprint.taps, vec![Tap { level: 2, x: 63, y: 63, weight: 1.0 }]);
    }

    #[test]
    fn bilinear_at_texel_centre_is_one_tap() {
        let levels = mip_level_dims(64, 64, 7);
        let desc = TextureDescriptor::default();
        let uv = Vec2::new(10.5 / 64.0, 20.5 / 64.0);
        let footprint = Footprint::compute(&desc, &levels, uv, 0.0);
        assert_eq!(footprint.taps.len(), 1);
        assert_eq!((footprint.taps[0].x, footprint.taps[0].y), (10, 20));
    }

    #[test]
    fn trilinear_weights_sum_to_one() {
        let levels = mip_level_dims(64, 64, 7);
        let desc = TextureDescriptor::default();
        let footprint = Footprint::compute(&desc, &levels, Vec2::new(0.3, 0.7), 1.25);
        let total: f32 = footprint.taps.iter().map(|t| t.weight).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-5);
        assert!(footprint.taps.iter().any(|t| t.level == 1));
        assert!(footprint.taps.iter().any(|t| t.level == 2));
    }

    #[test]
    fn address_modes() {
        assert_eq!(wrap(-1, 8, vk::SamplerAddressMode::CLAMP_TO_EDGE), Some(0));
        assert_eq!(wrap(9, 8, vk::SamplerAddressMode::REPEAT), Some(1));
        assert_eq!(wrap(-1, 8, vk::SamplerAddressMode::REPEAT), Some(7));
        assert_eq!(wrap(8, 8, vk::SamplerAddressMode::MIRRORED_REPEAT), Some(7));
        assert_eq!(wrap(-1, 8, vk::SamplerAddressMode::MIRRORED_REPEAT), Some(0));
        assert_eq!(wrap(8, 8, vk::SamplerAddressMode::CLAMP_TO_BORDER), None);
        assert_eq!(wrap(-3, 8, vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE), Some(2));
    }

    #[test]
    fn border_weight_is_tracked() {
        let levels = mip_level_dims(4, 4, 1);
        let desc = TextureDescriptor::default().with_address_mode(vk::SamplerAddressMode::CLAMP_TO_BORDER);
        let footprint = Footprint::compute(&desc, &levels, Vec2::ZERO, 0.0);
        assert_eq!(footprint.taps.len(), 1);
        assert_relative_eq!(footprint.border_weight, 0.75);
    }

    #[test]
    fn combine_stops_on_missing_texel() {
        let levels = mip_level_dims(8, 8, 1);
        let desc = TextureDescriptor::default();
        let footprint = Footprint::compute(&desc, &levels, Vec2::splat(0.5), 0.0);
        assert_eq!(footprint.taps.len(), 4);

        let sum = footprint.combine(|_| Some(Vec4::ONE)).unwrap();
        assert_relative_eq!(sum.x, 1.0);
        assert!(footprint.combine(|tap| (tap.x == 3).then_some(Vec4::ONE)).is_none());
    }
}
