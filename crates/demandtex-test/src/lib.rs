//! Test kernels and fixtures for demand-loaded textures.
//!
//! The kernels stand in for the application's rendering kernels: they are
//! submitted to a command queue, sample a grid of texture coordinates and
//! write one `f32x4` per pixel to device memory. Non-resident samples are
//! written as [`NON_RESIDENT_SENTINEL`](demandtex_core::constants::NON_RESIDENT_SENTINEL).

pub mod harness;
pub mod kernels;

pub use harness::{
    checkerboard, red_channel, save_image, write_debug_image, DemandHarness, FrameReport, OutputBuffer,
    OUTPUT_DIR_VAR,
};
pub use kernels::{
    launch_demand_texture_kernel, launch_sparse_texture_kernel, launch_texture_draw_kernel, OutputGrid,
    Viewport,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] demandtex_gpu::GpuError),
    #[error("Loader error: {0}")]
    Loader(#[from] demandtex_loader::Error),
    #[error("Frame loop did not settle within {0} frames")]
    Unsettled(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
