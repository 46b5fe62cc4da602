//! Frame loop driving the loader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use demandtex_core::{Options, TextureDescriptor, TextureId};
use demandtex_gpu::{BackendKind, CommandQueue, GpuContext, GpuContextBuilder, MemoryUsage};
use demandtex_image::ImageSourceCache;
use demandtex_loader::{DemandLoader, DeviceContext, LoaderStatistics};
use demandtex_test::{launch_texture_draw_kernel, save_image, OutputBuffer, Viewport};
use glam::Vec2;
use tracing::{debug, info};

/// Side of the procedural images in texels.
const PROCEDURAL_SIZE: f32 = 2048.0;

/// Benchmark parameters (from CLI or defaults).
#[derive(Debug, Clone)]
pub struct BenchParams {
    pub images: Vec<String>,
    pub directory: Option<PathBuf>,
    pub frames: usize,
    pub size: u32,
    pub unload_every: Option<usize>,
    pub config: Option<PathBuf>,
    pub no_sparse: bool,
    pub device: BackendKind,
    pub output: Option<PathBuf>,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            directory: None,
            frames: 120,
            size: 512,
            unload_every: None,
            config: None,
            no_sparse: false,
            device: BackendKind::Reference,
            output: None,
        }
    }
}

impl BenchParams {
    /// Parse parameters from command line arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut params = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let mut value = |name: &str| args.next().with_context(|| format!("{name} needs a value"));
            match arg.as_str() {
                "-i" | "--image" => params.images.push(value("--image")?),
                "-d" | "--dir" => params.directory = Some(value("--dir")?.into()),
                "-n" | "--frames" => params.frames = value("--frames")?.parse()?,
                "-s" | "--size" => params.size = value("--size")?.parse()?,
                "--unload-every" => params.unload_every = Some(value("--unload-every")?.parse()?),
                "-c" | "--config" => params.config = Some(value("--config")?.into()),
                "-o" | "--output" => params.output = Some(value("--output")?.into()),
                "--no-sparse" => params.no_sparse = true,
                "--device" => {
                    let name = value("--device")?;
                    params.device = BackendKind::parse(&name).with_context(|| format!("unknown device: {name}"))?;
                }
                other => bail!("unknown argument: {other}"),
            }
        }

        if params.images.is_empty() {
            params.images = vec!["checkerboard".to_string(), "mandelbrot".to_string()];
        }
        if params.size == 0 || params.frames == 0 {
            bail!("--size and --frames must be positive");
        }
        Ok(params)
    }

    fn options(&self) -> anyhow::Result<Options> {
        let options = match &self.config {
            Some(path) => {
                Options::load(path).with_context(|| format!("failed to load {}", path.display()))?
            }
            None => Options::default(),
        };
        Ok(if self.no_sparse {
            options.with_sparse_textures(false)
        } else {
            options
        })
    }

    fn image_path(&self, name: &str) -> String {
        match &self.directory {
            Some(dir) if name.contains('.') => dir.join(name).to_string_lossy().into_owned(),
            _ => name.to_string(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct BenchSummary {
    pub frames: usize,
    pub total_tasks: usize,
    pub busiest_frame: usize,
    pub elapsed: Duration,
    pub loader: LoaderStatistics,
    pub memory: MemoryUsage,
}

impl BenchSummary {
    pub fn log(&self) {
        let per_frame = self.elapsed.as_secs_f64() * 1000.0 / self.frames as f64;
        info!("Rendered {} frames in {:.2?} ({per_frame:.3} ms/frame)", self.frames, self.elapsed);
        info!(
            "Requests: {} tasks, busiest frame {} tasks, {} dropped launches",
            self.total_tasks, self.busiest_frame, self.loader.num_requests_dropped
        );
        info!(
            "Fills: {} tiles, {} mip tails, {} dense textures, {:.1} MB",
            self.loader.num_tiles_filled,
            self.loader.num_mip_tails_filled,
            self.loader.num_dense_textures_filled,
            self.loader.num_bytes_filled as f64 / (1024.0 * 1024.0)
        );
        info!(
            "Tile pools: {} pools, {:.1}/{:.1} MB in use, {} tiles unloaded",
            self.loader.tile_blocks.num_pools,
            self.loader.tile_blocks.bytes_in_use as f64 / (1024.0 * 1024.0),
            self.loader.tile_blocks.bytes_reserved as f64 / (1024.0 * 1024.0),
            self.loader.num_tiles_unloaded
        );
        info!(
            "Device memory: {:.1} MB, {} tile pool handles",
            self.memory.device_bytes as f64 / (1024.0 * 1024.0),
            self.memory.num_handles
        );
    }
}

/// Context, queue and loader for one run.
pub struct Bench {
    output: OutputBuffer,
    loader: DemandLoader,
    textures: Vec<TextureId>,
    cache: ImageSourceCache,
    queue: CommandQueue,
    context: Arc<GpuContext>,
}

impl Bench {
    pub fn new(params: &BenchParams) -> anyhow::Result<Self> {
        let context = GpuContextBuilder::new()
            .backend(params.device)
            .app_name("demandtex-bench")
            .build()?;
        info!("Device: {}", context.capabilities().summary());
        let queue = context.create_queue("bench");
        let mut loader = DemandLoader::new(Arc::clone(&context), params.options()?)?;

        let cache = ImageSourceCache::new();
        let mut textures = Vec::with_capacity(params.images.len());
        for name in &params.images {
            let path = params.image_path(name);
            let image = cache
                .get(&path)
                .with_context(|| format!("failed to create image source {path}"))?;
            textures.push(loader.create_texture(image, TextureDescriptor::default())?);
        }
        info!("Created {} textures", textures.len());

        let output = OutputBuffer::new(&context, params.size, params.size)?;
        Ok(Self {
            output,
            loader,
            textures,
            cache,
            queue,
            context,
        })
    }

    /// Viewport of `frame`: a slow pan while zooming in and out.
    fn viewport(&self, frame: usize, size: u32) -> Viewport {
        let cells = (self.textures.len() as f32).sqrt().ceil().max(1.0);
        let cell_pixels = size as f32 / cells;
        let t = frame as f32 * 0.05;
        let extent = 0.15 + 0.85 * (0.5 + 0.5 * t.cos());
        Viewport {
            origin: Vec2::new(0.5 + 0.4 * (t * 0.7).sin(), 0.5 + 0.4 * (t * 0.3).cos()) - Vec2::splat(extent * 0.5),
            extent,
            base_lod: (PROCEDURAL_SIZE / cell_pixels).log2(),
        }
    }

    pub fn run(&mut self, params: &BenchParams) -> anyhow::Result<BenchSummary> {
        let mut device_context = DeviceContext::new();
        let mut total_tasks = 0;
        let mut busiest_frame = 0;
        let start = Instant::now();

        for frame in 0..params.frames {
            if let Some(every) = params.unload_every {
                if every > 0 && frame > 0 && frame % every == 0 {
                    self.unload_all()?;
                }
            }

            self.loader.launch_prepare(&self.queue, &mut device_context)?;
            launch_texture_draw_kernel(
                &self.queue,
                &self.context,
                &device_context,
                &self.textures,
                self.output.grid(),
                self.viewport(frame, params.size),
            );
            let ticket = self.loader.process_requests(&self.queue, &device_context)?;
            ticket.wait()?;

            total_tasks += ticket.num_tasks_total();
            busiest_frame = busiest_frame.max(ticket.num_tasks_total());
            debug!(frame, tasks = ticket.num_tasks_total(), "Frame done");
        }
        self.queue.synchronize()?;
        let elapsed = start.elapsed();

        if let Some(path) = &params.output {
            let texels = self.output.read()?;
            save_image(&texels, params.size, params.size, path)?;
            info!("Saved last frame to {}", path.display());
        }

        let images = self.cache.statistics();
        info!(
            "Image sources: {} open, {} tiles read, {:.1} MB read",
            images.num_image_sources,
            images.num_tiles_read,
            images.num_bytes_read as f64 / (1024.0 * 1024.0)
        );

        Ok(BenchSummary {
            frames: params.frames,
            total_tasks,
            busiest_frame,
            elapsed,
            loader: self.loader.statistics(),
            memory: self.context.memory_usage(),
        })
    }

    fn unload_all(&mut self) -> anyhow::Result<()> {
        let mut unloaded = 0;
        for &id in &self.textures {
            unloaded += self.loader.unload_texture_tiles(&self.queue, id)?;
        }
        debug!(unloaded, "Unloaded texture tiles");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| (*arg).to_string()).collect()
    }

    #[test]
    fn defaults() {
        let params = BenchParams::parse(Vec::new()).unwrap();
        assert_eq!(params.images, ["checkerboard", "mandelbrot"]);
        assert_eq!(params.frames, 120);
        assert!(params.options().unwrap().use_sparse_textures);
    }

    #[test]
    fn parses_options() {
        let params = BenchParams::parse(args(&[
            "-i", "a.png", "--dir", "assets", "-n", "10", "--unload-every", "5", "--no-sparse", "--device", "vk",
        ]))
        .unwrap();
        assert_eq!(params.device, BackendKind::Vulkan);
        assert_eq!(params.images, ["a.png"]);
        assert_eq!(params.frames, 10);
        assert_eq!(params.unload_every, Some(5));
        assert!(!params.options().unwrap().use_sparse_textures);
        assert_eq!(params.image_path("a.png"), PathBuf::from("assets").join("a.png").to_string_lossy());
        assert_eq!(params.image_path("mandelbrot"), "mandelbrot");
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(BenchParams::parse(args(&["--frames"])).is_err());
        assert!(BenchParams::parse(args(&["--bogus"])).is_err());
        assert!(BenchParams::parse(args(&["--size", "0"])).is_err());
        assert!(BenchParams::parse(args(&["--device", "metal"])).is_err());
    }

    #[test]
    fn short_run_loads_textures() {
        let params = BenchParams::parse(args(&["-n", "4", "-s", "64"])).unwrap();
        let mut bench = Bench::new(&params).unwrap();
        let summary = bench.run(&params).unwrap();
        assert_eq!(summary.frames, 4);
        assert!(summary.total_tasks >= 2);
        assert_eq!(summary.loader.num_textures, 2);
    }
}
