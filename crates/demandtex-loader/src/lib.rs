//! Demand loading of sparse and dense textures.
//!
//! Kernels sample textures through a [`DeviceContext`]. Lookups that touch
//! data that is not resident record a page miss and return `None`. Once per
//! frame the [`DemandLoader`] harvests the misses, loads the missing tiles,
//! mip tails and dense textures from their image sources and returns a
//! [`Ticket`] for the copies it issued.
//!
//! This crate provides:
//! - [`TileBlockAllocator`], the backing store for sparse tiles and mip tails
//! - [`DemandTexture`], the per-texture placement and fill logic
//! - [`PageTableManager`], the mapping from page ids to textures
//! - [`DemandLoader`], [`DeviceContext`] and [`Ticket`]

pub mod deferred;
pub mod demand_texture;
pub mod device_context;
pub mod error;
pub mod loader;
pub mod page_table;
pub mod ticket;
pub mod tile_allocator;

pub use deferred::DeferredBlockRelease;
pub use demand_texture::{DemandTexture, TexturePages, TextureState};
pub use device_context::{DeviceContext, SamplerRecord, SparseSampler};
pub use error::{Error, Result};
pub use loader::{DemandLoader, LoaderStatistics};
pub use page_table::{PageRange, PageTableManager, ResolvedPage};
pub use ticket::Ticket;
pub use tile_allocator::{TileBlockAllocator, TileBlockDesc, TileBlockHandle, TileBlockStatistics};
