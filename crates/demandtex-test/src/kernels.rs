//! Sampling kernels run as queue commands.

use std::sync::Arc;

use demandtex_core::constants::NON_RESIDENT_SENTINEL;
use demandtex_core::TextureId;
use demandtex_gpu::{CommandQueue, DevicePtr, GpuContext, TextureObject};
use demandtex_loader::DeviceContext;
use glam::{Vec2, Vec4};

/// Device memory a kernel writes one `f32x4` per pixel to, row by row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputGrid {
    /// Start of the output
    pub ptr: DevicePtr,
    /// Pixels per row
    pub width: u32,
    /// Rows
    pub height: u32,
}

impl OutputGrid {
    /// Size of the output in bytes.
    pub const fn size_bytes(&self) -> usize {
        self.width as usize * self.height as usize * std::mem::size_of::<Vec4>()
    }

    /// Texture coordinate of the centre of pixel (`x`, `y`).
    pub fn pixel_uv(&self, x: u32, y: u32) -> Vec2 {
        Vec2::new(
            (x as f32 + 0.5) / self.width as f32,
            (y as f32 + 0.5) / self.height as f32,
        )
    }
}

/// Region of texture space shown by [`launch_texture_draw_kernel`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    /// Texture coordinate at the top left corner of each cell
    pub origin: Vec2,
    /// Texture space covered by one cell
    pub extent: f32,
    /// Level of detail at an extent of 1
    pub base_lod: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            origin: Vec2::ZERO,
            extent: 1.0,
            base_lod: 0.0,
        }
    }
}

impl Viewport {
    /// Level of detail at this zoom.
    pub fn lod(&self) -> f32 {
        (self.base_lod + self.extent.log2()).max(0.0)
    }
}

fn run_grid<F>(context: &GpuContext, grid: OutputGrid, mut sample: F) -> demandtex_gpu::Result<()>
where
    F: FnMut(u32, u32) -> Option<Vec4>,
{
    let mut texels = Vec::with_capacity(grid.width as usize * grid.height as usize);
    for y in 0..grid.height {
        for x in 0..grid.width {
            texels.push(sample(x, y).unwrap_or(Vec4::splat(NON_RESIDENT_SENTINEL)));
        }
    }
    context.write_memory(grid.ptr, bytemuck::cast_slice(texels.as_slice()))
}

/// Sample a texture object directly, without residency tracking.
pub fn launch_sparse_texture_kernel(
    queue: &CommandQueue,
    context: &Arc<GpuContext>,
    texture: TextureObject,
    output: OutputGrid,
    lod: f32,
) {
    let context = Arc::clone(context);
    queue.submit("sparse_texture_kernel", move || {
        run_grid(&context, output, |x, y| context.sample(texture, output.pixel_uv(x, y), lod))
    });
}

/// Sample a demand-loaded texture through a prepared [`DeviceContext`].
pub fn launch_demand_texture_kernel(
    queue: &CommandQueue,
    context: &Arc<GpuContext>,
    device_context: &DeviceContext,
    texture: TextureId,
    output: OutputGrid,
    lod: f32,
) {
    let context = Arc::clone(context);
    let device_context = device_context.clone();
    queue.submit("demand_texture_kernel", move || {
        run_grid(&context, output, |x, y| {
            device_context.tex2d_lod(texture, output.pixel_uv(x, y), lod)
        })
    });
}

/// Draw `textures` side by side in a square grid of cells.
///
/// Every cell shows the viewport's region of its texture.
pub fn launch_texture_draw_kernel(
    queue: &CommandQueue,
    context: &Arc<GpuContext>,
    device_context: &DeviceContext,
    textures: &[TextureId],
    output: OutputGrid,
    viewport: Viewport,
) {
    let context = Arc::clone(context);
    let device_context = device_context.clone();
    let textures = textures.to_vec();
    let cells = (textures.len() as f32).sqrt().ceil().max(1.0) as u32;
    let lod = viewport.lod();

    queue.submit("texture_draw_kernel", move || {
        let cell_width = output.width.div_ceil(cells).max(1);
        let cell_height = output.height.div_ceil(cells).max(1);
        run_grid(&context, output, |x, y| {
            let cell = (y / cell_height) * cells + x / cell_width;
            let texture = *textures.get(cell as usize)?;
            let local = Vec2::new(
                ((x % cell_width) as f32 + 0.5) / cell_width as f32,
                ((y % cell_height) as f32 + 0.5) / cell_height as f32,
            );
            device_context.tex2d_lod(texture, viewport.origin + local * viewport.extent, lod)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_centres() {
        let grid = OutputGrid {
            ptr: DevicePtr::NULL,
            width: 4,
            height: 2,
        };
        assert_eq!(grid.pixel_uv(0, 0), Vec2::new(0.125, 0.25));
        assert_eq!(grid.pixel_uv(3, 1), Vec2::new(0.875, 0.75));
        assert_eq!(grid.size_bytes(), 128);
    }

    #[test]
    fn viewport_lod_follows_zoom() {
        assert_eq!(Viewport::default().lod(), 0.0);
        let zoomed_out = Viewport {
            extent: 4.0,
            base_lod: 1.0,
            ..Viewport::default()
        };
        assert_eq!(zoomed_out.lod(), 3.0);
        let zoomed_in = Viewport {
            extent: 0.25,
            ..Viewport::default()
        };
        assert_eq!(zoomed_in.lod(), 0.0);
    }
}
