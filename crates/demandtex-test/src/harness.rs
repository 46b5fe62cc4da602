//! Fixtures for driving the demand loader without an application.
//!
//! [`DemandHarness`] owns a context, a queue, a loader and an output buffer
//! and runs the per-frame loop: prepare, launch, process, wait.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use demandtex_core::{Options, TextureDescriptor, TextureId};
use demandtex_gpu::{
    Allocation, CommandQueue, DeviceAllocator, GpuContext, GpuContextBuilder, MemoryAllocator,
};
use demandtex_image::{CheckerBoardImage, ImageSource};
use demandtex_loader::{DemandLoader, DeviceContext};
use glam::Vec4;
use image::{ImageBuffer, Rgba};

use crate::kernels::{launch_demand_texture_kernel, OutputGrid};
use crate::Result;

/// Environment variable naming a directory to write kernel output images to.
pub const OUTPUT_DIR_VAR: &str = "DEMANDTEX_TEST_OUTPUT";

/// Device memory that kernels write their results to.
pub struct OutputBuffer {
    context: Arc<GpuContext>,
    allocator: DeviceAllocator,
    allocation: Allocation,
    grid: OutputGrid,
}

impl OutputBuffer {
    /// Allocate a `width` x `height` buffer in `context`, which must be current.
    pub fn new(context: &Arc<GpuContext>, width: u32, height: u32) -> Result<Self> {
        let allocator = DeviceAllocator::new(Arc::clone(context));
        let size = width as usize * height as usize * std::mem::size_of::<Vec4>();
        let allocation = allocator.allocate(size, None)?;
        let ptr = allocation.as_ptr().unwrap_or_default();
        Ok(Self {
            context: Arc::clone(context),
            allocator,
            allocation,
            grid: OutputGrid { ptr, width, height },
        })
    }

    /// Where kernels should write.
    pub const fn grid(&self) -> OutputGrid {
        self.grid
    }

    /// Copy the output back, one texel per pixel in row order.
    ///
    /// Only meaningful once the kernels that write it have retired.
    pub fn read(&self) -> Result<Vec<Vec4>> {
        let bytes = self.context.read_memory(self.grid.ptr, self.grid.size_bytes())?;
        let floats: Vec<f32> = bytemuck::pod_collect_to_vec(bytes.as_slice());
        Ok(floats.chunks_exact(4).map(Vec4::from_slice).collect())
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.allocator.free(self.allocation, None) {
            tracing::warn!("Failed to free output buffer: {err}");
        }
    }
}

/// Outcome of [`DemandHarness::render_until_resident`].
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Tasks issued by each frame, the final zero included
    pub tasks_per_frame: Vec<usize>,
    /// Output of the final frame
    pub texels: Vec<Vec4>,
}

impl FrameReport {
    /// Number of frames rendered.
    pub fn frames(&self) -> usize {
        self.tasks_per_frame.len()
    }
}

/// A context, queue, loader and output buffer wired together.
pub struct DemandHarness {
    output: OutputBuffer,
    device_context: DeviceContext,
    loader: DemandLoader,
    queue: CommandQueue,
    context: Arc<GpuContext>,
}

impl DemandHarness {
    /// Create a harness on a default reference device.
    pub fn new(options: Options, width: u32, height: u32) -> Result<Self> {
        let context = GpuContextBuilder::new().build()?;
        Self::with_context(context, options, width, height)
    }

    /// Create a harness on `context`, which must be current.
    pub fn with_context(context: Arc<GpuContext>, options: Options, width: u32, height: u32) -> Result<Self> {
        let queue = context.create_queue("harness");
        let loader = DemandLoader::new(Arc::clone(&context), options)?;
        let output = OutputBuffer::new(&context, width, height)?;
        Ok(Self {
            output,
            device_context: DeviceContext::new(),
            loader,
            queue,
            context,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn loader(&self) -> &DemandLoader {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut DemandLoader {
        &mut self.loader
    }

    /// Register a texture with the loader.
    pub fn create_texture(&mut self, image: Arc<dyn ImageSource>, descriptor: TextureDescriptor) -> Result<TextureId> {
        Ok(self.loader.create_texture(image, descriptor)?)
    }

    /// Run one frame sampling `texture` at `lod`.
    ///
    /// Returns the frame's output and the number of tasks it issued.
    pub fn frame(&mut self, texture: TextureId, lod: f32) -> Result<(Vec<Vec4>, usize)> {
        self.loader.launch_prepare(&self.queue, &mut self.device_context)?;
        launch_demand_texture_kernel(
            &self.queue,
            &self.context,
            &self.device_context,
            texture,
            self.output.grid(),
            lod,
        );
        let ticket = self.loader.process_requests(&self.queue, &self.device_context)?;
        ticket.wait()?;
        Ok((self.output.read()?, ticket.num_tasks_total()))
    }

    /// Render frames until one issues no tasks.
    pub fn render_until_resident(&mut self, texture: TextureId, lod: f32, max_frames: usize) -> Result<FrameReport> {
        let mut tasks_per_frame = Vec::new();
        while tasks_per_frame.len() < max_frames {
            let (texels, tasks) = self.frame(texture, lod)?;
            tasks_per_frame.push(tasks);
            if tasks == 0 {
                return Ok(FrameReport {
                    tasks_per_frame,
                    texels,
                });
            }
        }
        Err(crate::TestError::Unsettled(max_frames))
    }
}

/// A 4-channel float checkerboard source.
pub fn checkerboard(size: u32, squares_per_side: u32, use_mipmaps: bool, tiled: bool) -> Arc<dyn ImageSource> {
    Arc::new(CheckerBoardImage::new(size, size, squares_per_side, use_mipmaps, tiled))
}

/// Red channel of kernel output, one row per output row.
pub fn red_channel(texels: &[Vec4], width: u32) -> Vec<Vec<f32>> {
    texels
        .chunks(width as usize)
        .map(|row| row.iter().map(|texel| texel.x).collect())
        .collect()
}

/// Write kernel output as an 8-bit RGBA image. Sentinel texels come out black.
pub fn save_image(texels: &[Vec4], width: u32, height: u32, path: impl AsRef<Path>) -> Result<()> {
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        let texel = texels
            .get((y * width + x) as usize)
            .copied()
            .unwrap_or(Vec4::ZERO);
        let rgb = (texel.truncate().clamp(glam::Vec3::ZERO, glam::Vec3::ONE) * 255.0).round();
        Rgba([rgb.x as u8, rgb.y as u8, rgb.z as u8, 255])
    });
    image.save(path)?;
    Ok(())
}

/// Write kernel output to the directory named by [`OUTPUT_DIR_VAR`], if set.
pub fn write_debug_image(name: &str, texels: &[Vec4], width: u32, height: u32) -> Result<Option<PathBuf>> {
    let Some(dir) = std::env::var_os(OUTPUT_DIR_VAR) else {
        return Ok(None);
    };
    let dir = PathBuf::from(dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{name}.png"));
    save_image(texels, width, height, &path)?;
    tracing::info!("Wrote {}", path.display());
    Ok(Some(path))
}
