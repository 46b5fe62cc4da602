//! Demand texture frame loop benchmark
//!
//! Draws a set of demand-loaded textures side by side on the reference or Vulkan device
//! while panning and zooming, and reports what the loader had to do.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p demandtex-bench -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-i, --image <NAME>`: Image to load (repeatable): `checkerboard`, `mandelbrot` or a file
//! - `-d, --dir <DIR>`: Directory image files are looked up in
//! - `-n, --frames <N>`: Number of frames to render (default: 120)
//! - `-s, --size <N>`: Output width and height in pixels (default: 512)
//! - `--unload-every <N>`: Unload every texture's tiles each N frames (default: never)
//! - `-c, --config <FILE>`: Loader options as JSON
//! - `--no-sparse`: Place every texture densely
//! - `--device <NAME>`: `reference` (default) or `vulkan`
//! - `-o, --output <FILE>`: Write the last frame as a PNG
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod bench;

use tracing_subscriber::EnvFilter;

use crate::bench::{Bench, BenchParams};

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let params = BenchParams::from_args()?;
    let mut bench = Bench::new(&params)?;
    let summary = bench.run(&params)?;
    summary.log();
    Ok(())
}

fn print_help() {
    eprintln!(
        "Demand texture frame loop benchmark

USAGE:
    cargo run -p demandtex-bench -- [OPTIONS]

IMAGE OPTIONS:
    -i, --image <NAME>      Image to load; repeat for several textures
                            checkerboard, mandelbrot or an image file
                            Default: checkerboard and mandelbrot
    -d, --dir <DIR>         Directory image files are looked up in

FRAME OPTIONS:
    -n, --frames <N>        Number of frames to render (default: 120)
    -s, --size <N>          Output width and height in pixels (default: 512)
    --unload-every <N>      Unload every texture's tiles each N frames
    -o, --output <FILE>     Write the last frame as a PNG

LOADER OPTIONS:
    -c, --config <FILE>     Loader options as JSON; missing fields keep defaults
    --no-sparse             Place every texture densely
    --device <NAME>         reference (default) or vulkan

OTHER:
    -h, --help              Print this help message

EXAMPLES:
    # Default textures
    cargo run -p demandtex-bench

    # One image file, smaller miss buffer
    cargo run -p demandtex-bench -- -i photo.png -c options.json

    # Exercise tile unloading and keep the last frame
    cargo run -p demandtex-bench -- --unload-every 30 -o last_frame.png

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
