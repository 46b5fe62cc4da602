//! Procedural Mandelbrot set.

use demandtex_core::MipLevelDims;
use glam::{DVec2, Vec4};

use crate::procedural::{Pattern, ProceduralImage};

/// Escape-time colouring of the Mandelbrot set over a rectangle of the
/// complex plane. Every level is computed at its own resolution.
#[derive(Clone, Debug)]
pub struct Mandelbrot {
    min: DVec2,
    max: DVec2,
    max_iterations: u32,
    colors: Vec<Vec4>,
}

impl Mandelbrot {
    /// Number of iterations before the orbit of `c` escapes, capped at the maximum.
    pub fn escape_time(&self, c: DVec2) -> u32 {
        let mut z = DVec2::ZERO;
        for iteration in 0..self.max_iterations {
            if z.length_squared() > 4.0 {
                return iteration;
            }
            z = DVec2::new(z.x * z.x - z.y * z.y, 2.0 * z.x * z.y) + c;
        }
        self.max_iterations
    }

    fn color(&self, iterations: u32) -> Vec4 {
        let t = iterations as f32 / self.max_iterations.max(1) as f32;
        let position = t * (self.colors.len() - 1) as f32;
        let index = (position.floor() as usize).min(self.colors.len() - 2);
        self.colors[index].lerp(self.colors[index + 1], position - index as f32)
    }
}

impl Pattern for Mandelbrot {
    fn texel(&self, _level: u32, dims: MipLevelDims, x: u32, y: u32) -> Vec4 {
        let uv = (DVec2::new(f64::from(x), f64::from(y)) + 0.5) / dims.as_dvec2();
        self.color(self.escape_time(self.min + uv * (self.max - self.min)))
    }
}

/// Procedural RGBA float Mandelbrot image.
pub type MandelbrotImage = ProceduralImage<Mandelbrot>;

impl MandelbrotImage {
    /// Create an image of the square [-2, 2] x [-2, 2].
    pub fn new(width: u32, height: u32, max_iterations: u32) -> Self {
        Self::with_pattern(
            width,
            height,
            true,
            true,
            Mandelbrot {
                min: DVec2::splat(-2.0),
                max: DVec2::splat(2.0),
                max_iterations,
                colors: vec![
                    Vec4::new(1.0, 1.0, 1.0, 0.0),
                    Vec4::new(0.0, 0.0, 1.0, 0.0),
                    Vec4::new(0.0, 0.5, 0.0, 0.0),
                    Vec4::new(1.0, 0.0, 0.0, 0.0),
                    Vec4::new(1.0, 1.0, 0.0, 0.0),
                ],
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ImageSource;
    use approx::assert_relative_eq;

    #[test]
    fn origin_is_inside_the_set() {
        let image = MandelbrotImage::new(64, 64, 100);
        assert_eq!(image.pattern().escape_time(DVec2::ZERO), 100);
        assert!(image.pattern().escape_time(DVec2::new(1.9, 1.9)) < 3);
    }

    #[test]
    fn inside_and_outside_colours() {
        let image = MandelbrotImage::new(64, 64, 100);
        image.open().unwrap();
        let mut level = vec![0u8; 64 * 64 * 16];
        assert!(image.read_mip_level(&mut level, 0, 64, 64).unwrap());

        let centre = demandtex_core::ChannelFormat::F32.decode_texel(4, &level[(32 * 64 + 32) * 16..]);
        assert_relative_eq!(centre.x, 1.0);
        assert_relative_eq!(centre.y, 1.0);
        assert_relative_eq!(centre.z, 0.0);

        let corner = demandtex_core::ChannelFormat::F32.decode_texel(4, &level[..16]);
        assert!(corner.z > 0.9);
    }
}
