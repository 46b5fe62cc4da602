//! Loader error types.

use demandtex_core::TextureId;
use demandtex_gpu::{ContextId, GpuError};
use demandtex_image::ImageSourceError;
use thiserror::Error;

/// Demand loading errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Backing store exhausted.
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes that could still be provided.
        available: usize,
    },

    /// Called with a different GPU context current than the loader was created with.
    #[error("Context mismatch: expected {expected}, current is {actual:?}")]
    ContextMismatch {
        /// Context the loader was created with.
        expected: ContextId,
        /// Context current on the calling thread.
        actual: Option<ContextId>,
    },

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The image source cannot be opened or served.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Not enough pages left in the page table.
    #[error("Page table full: {requested} pages requested, {available} available")]
    PageTableFull {
        /// Pages requested.
        requested: u32,
        /// Pages still free.
        available: u32,
    },

    /// No texture with this id.
    #[error("Unknown texture: {0}")]
    UnknownTexture(TextureId),

    /// Options are inconsistent.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Other device error.
    #[error("GPU error: {0}")]
    Gpu(GpuError),

    /// Image source error.
    #[error("Image source error: {0}")]
    Image(#[from] ImageSourceError),
}

impl From<GpuError> for Error {
    fn from(err: GpuError) -> Self {
        match err {
            GpuError::OutOfMemory { requested, available } => Self::OutOfMemory { requested, available },
            GpuError::ContextMismatch { expected, actual } => Self::ContextMismatch { expected, actual },
            other => Self::Gpu(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
