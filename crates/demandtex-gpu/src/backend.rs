//! Device backends.
//!
//! A [`GpuContext`](crate::GpuContext) keeps the host-side view of its
//! textures (descriptors, layouts, which sparse regions are bound where) and
//! hands storage to a backend. The reference backend keeps everything in
//! process memory; the Vulkan backend puts it on a device.

use std::sync::Arc;

use crate::error::Result;
use crate::memory::{DevicePtr, MemHandle, MemorySpace, MemoryUsage};
use crate::texture::{ImageLayout, SparseProperties, SparseRegion, TextureObject, TextureRecord};

/// Which device a context runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process model of a sparse-texture device.
    #[default]
    Reference,
    /// A Vulkan device with sparse residency.
    Vulkan,
}

impl BackendKind {
    /// Parse a backend name (`reference` or `vulkan`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "reference" | "ref" => Some(Self::Reference),
            "vulkan" | "vk" => Some(Self::Vulkan),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Reference => "reference",
            Self::Vulkan => "vulkan",
        })
    }
}

/// Where a sparse region is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) handle: MemHandle,
    pub(crate) offset: usize,
}

/// Completion counter of the work a backend has put on its device.
///
/// Values only grow. Work submitted as value `n` has finished once
/// `completed() >= n`.
pub(crate) trait DeviceTimeline: Send + Sync {
    /// Value of the latest submitted work.
    fn submitted(&self) -> u64;

    /// Value of the latest finished work.
    fn completed(&self) -> Result<u64>;

    /// Block until `value` has finished.
    fn wait(&self, value: u64) -> Result<()>;
}

/// Storage and device work behind a context.
///
/// Calls that touch a texture receive its record, so backends need no
/// registry of their own for layouts and bindings.
pub(crate) trait DeviceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn usage(&self) -> MemoryUsage;

    fn timeline(&self) -> Arc<dyn DeviceTimeline>;

    fn allocate_linear(&self, space: MemorySpace, size: usize) -> Result<DevicePtr>;

    fn free_linear(&self, ptr: DevicePtr) -> Result<()>;

    fn read_linear(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>>;

    fn write_linear(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()>;

    fn fill_linear(&self, ptr: DevicePtr, value: u8, len: usize) -> Result<()>;

    fn create_pool(&self, size: usize) -> Result<MemHandle>;

    fn release_pool(&self, handle: MemHandle) -> Result<()>;

    fn read_pool(&self, handle: MemHandle, offset: usize, len: usize) -> Result<Vec<u8>>;

    fn write_pool(&self, handle: MemHandle, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Tile geometry the device gives a sparse image with `layout`.
    fn sparse_properties(&self, layout: &ImageLayout) -> Result<SparseProperties>;

    /// Create the image of a new texture. `sparse` is `None` for a dense
    /// image with storage for the whole chain.
    fn create_image(&self, object: TextureObject, layout: &ImageLayout, sparse: Option<&SparseProperties>) -> Result<()>;

    fn destroy_image(&self, object: TextureObject, record: &TextureRecord) -> Result<()>;

    /// Bind `region` to `binding` and upload `bytes` into it.
    ///
    /// `size` is the byte size of the region.
    fn bind_region(
        &self,
        object: TextureObject,
        record: &TextureRecord,
        region: SparseRegion,
        binding: Binding,
        size: usize,
        bytes: &[u8],
    ) -> Result<()>;

    fn unbind_region(&self, object: TextureObject, record: &TextureRecord, region: SparseRegion) -> Result<()>;

    /// Upload a whole mip chain into a dense image.
    fn write_image(&self, object: TextureObject, record: &TextureRecord, bytes: &[u8]) -> Result<()>;

    /// Read the texel at byte `offset` of `region` (the whole chain of a
    /// dense image when `None`) into `out`.
    fn read_texel(
        &self,
        object: TextureObject,
        record: &TextureRecord,
        region: Option<SparseRegion>,
        offset: usize,
        out: &mut [u8],
    ) -> Result<()>;
}
