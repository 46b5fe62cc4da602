//! GPU error types.

use ash::vk;
use thiserror::Error;

use crate::context::ContextId;

/// GPU-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No device with the required features was found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The device memory allocator failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// No context is current on the calling thread.
    #[error("No GPU context is current on this thread")]
    NoCurrentContext,

    /// The current context differs from the one an object was created in.
    #[error("Context mismatch: expected {expected}, current is {actual:?}")]
    ContextMismatch {
        /// Context recorded at construction.
        expected: ContextId,
        /// Context current on the calling thread.
        actual: Option<ContextId>,
    },

    /// Device memory budget exhausted.
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes left in the budget.
        available: usize,
    },

    /// Address does not fall inside a live allocation.
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    /// Memory handle is unknown or released.
    #[error("Invalid memory handle: {0}")]
    InvalidHandle(u64),

    /// Texture object is unknown or destroyed.
    #[error("Invalid texture object: {0}")]
    InvalidTexture(u64),

    /// Feature not supported by the device.
    #[error("Feature not supported: {0}")]
    UnsupportedFeature(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
