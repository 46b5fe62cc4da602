//! GPU device layer for demand-loaded textures.
//!
//! Contexts run on one of two backends: an in-process reference device, or a
//! Vulkan device with sparse-resident images. This crate provides:
//! - Device contexts with per-thread "current context" binding
//! - GPU capability description
//! - In-order command queues and completion events
//! - Unified-address memory and the allocator strategies
//! - Sparse and dense texture objects and a texture sampler

mod backend;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod error;
pub mod memory;
mod reference;
pub mod sampler;
pub mod sync;
pub mod texture;
mod vulkan;

pub use backend::BackendKind;

pub use capabilities::GpuCapabilities;
pub use command::CommandQueue;
pub use context::{check_context, current_context, ContextId, GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{
    AllocatorKind, AnyAllocator, Allocation, DeviceAllocator, DeviceAsyncAllocator, DevicePtr,
    FillSource, HostAllocator, MemHandle, MemoryAllocator, MemorySpace, MemoryUsage,
    PinnedAllocator, TextureTileAllocator,
};
pub use sampler::{Footprint, Tap};
pub use sync::QueueEvent;
pub use texture::{ImageLayout, SparseProperties, SparseRegion, TextureObject};
