//! Image sources for demand-loaded textures.
//!
//! An image source describes an image (extent, format, mip levels) once it is
//! opened and then serves its texels on request, one tile, one mip level or
//! the whole mip tail at a time.
//!
//! This crate provides:
//! - The [`ImageSource`] capability
//! - Procedural sources ([`CheckerBoardImage`], [`MandelbrotImage`], [`ProceduralImage`])
//! - A file-backed source decoded with the `image` crate ([`FileImage`])
//! - [`create_image_source`] and the [`ImageSourceCache`]

pub mod cache;
pub mod checkerboard;
pub mod error;
pub mod file;
pub mod mandelbrot;
pub mod procedural;
pub mod source;

pub use cache::{CacheStatistics, ImageSourceCache};
pub use checkerboard::{CheckerBoardImage, Checkerboard};
pub use error::{ImageSourceError, Result};
pub use file::FileImage;
pub use mandelbrot::MandelbrotImage;
pub use procedural::{Pattern, ProceduralImage};
pub use source::{create_image_source, ImageSource};
