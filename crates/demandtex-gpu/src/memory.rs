//! Device memory and allocator strategies.
//!
//! Linear allocations (host, pinned and device) share one unified address
//! space and are addressed through [`DevicePtr`]. On Vulkan the pointer is
//! the buffer's device address. Tile pools used as sparse texture backing
//! store are opaque [`MemHandle`]s addressed by (handle, byte offset).

use std::sync::Arc;

use crate::backend::DeviceBackend;
use crate::command::CommandQueue;
use crate::context::{check_context, GpuContext};
use crate::error::{GpuError, Result};

/// Where a linear allocation lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Ordinary process memory.
    Host,
    /// Page-locked host memory.
    Pinned,
    /// Device memory.
    Device,
}

/// Address in the unified address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null pointer.
    pub const NULL: Self = Self(0);

    pub(crate) const fn from_raw(address: u64) -> Self {
        Self(address)
    }

    /// Raw address.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check for null.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one.
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

/// Opaque handle to a tile pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemHandle(u64);

impl MemHandle {
    pub(crate) const fn from_raw(handle: u64) -> Self {
        Self(handle)
    }

    /// Raw handle value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Result of an allocation: an addressable pointer or an opaque handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Allocation {
    /// Linear memory; supports pointer arithmetic.
    Pointer(DevicePtr),
    /// Tile pool; addressed by byte offset only.
    Handle(MemHandle),
}

impl Allocation {
    /// The pointer, if this is a linear allocation.
    pub const fn as_ptr(self) -> Option<DevicePtr> {
        match self {
            Self::Pointer(ptr) => Some(ptr),
            Self::Handle(_) => None,
        }
    }

    /// The handle, if this is a tile pool.
    pub const fn as_handle(self) -> Option<MemHandle> {
        match self {
            Self::Pointer(_) => None,
            Self::Handle(handle) => Some(handle),
        }
    }

    /// Check whether this is a handle.
    pub const fn is_handle(self) -> bool {
        matches!(self, Self::Handle(_))
    }
}

/// Snapshot of memory usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Device bytes in use (linear, tile pools and dense textures).
    pub device_bytes: u64,
    /// Host bytes in use.
    pub host_bytes: u64,
    /// Pinned host bytes in use.
    pub pinned_bytes: u64,
    /// Number of live tile pools.
    pub num_handles: usize,
}

/// Usage accounting against the device memory budget.
///
/// Both backends charge device bytes here, so running out of budget looks
/// the same whatever the device.
#[derive(Debug)]
pub(crate) struct MemoryBudget {
    device_budget: u64,
    usage: MemoryUsage,
}

impl MemoryBudget {
    pub(crate) fn new(device_budget: u64) -> Self {
        Self {
            device_budget,
            usage: MemoryUsage::default(),
        }
    }

    pub(crate) fn usage(&self) -> MemoryUsage {
        self.usage
    }

    /// Reserve `bytes` of the device budget.
    pub(crate) fn charge(&mut self, bytes: usize) -> Result<()> {
        let available = self.device_budget.saturating_sub(self.usage.device_bytes);
        if bytes as u64 > available {
            return Err(GpuError::OutOfMemory {
                requested: bytes,
                available: available as usize,
            });
        }
        self.usage.device_bytes += bytes as u64;
        Ok(())
    }

    /// Return `bytes` to the device budget.
    pub(crate) fn release(&mut self, bytes: usize) {
        self.usage.device_bytes = self.usage.device_bytes.saturating_sub(bytes as u64);
    }

    pub(crate) fn add_linear(&mut self, space: MemorySpace, size: usize) -> Result<()> {
        match space {
            MemorySpace::Device => self.charge(size)?,
            MemorySpace::Host => self.usage.host_bytes += size as u64,
            MemorySpace::Pinned => self.usage.pinned_bytes += size as u64,
        }
        Ok(())
    }

    pub(crate) fn remove_linear(&mut self, space: MemorySpace, size: usize) {
        let size = size as u64;
        match space {
            MemorySpace::Device => self.usage.device_bytes = self.usage.device_bytes.saturating_sub(size),
            MemorySpace::Host => self.usage.host_bytes = self.usage.host_bytes.saturating_sub(size),
            MemorySpace::Pinned => self.usage.pinned_bytes = self.usage.pinned_bytes.saturating_sub(size),
        }
    }

    pub(crate) fn add_pool(&mut self, size: usize) -> Result<()> {
        self.charge(size)?;
        self.usage.num_handles += 1;
        Ok(())
    }

    pub(crate) fn remove_pool(&mut self, size: usize) {
        self.release(size);
        self.usage.num_handles = self.usage.num_handles.saturating_sub(1);
    }
}

/// Bytes handed to a fill operation.
///
/// Host data is staged when the fill is issued, so the caller's buffer may be
/// reused immediately. Owned data moves into the command without a copy.
/// Device data is read when the command executes, in queue order.
#[derive(Debug)]
pub enum FillSource<'a> {
    /// Borrowed host bytes, copied at issue time.
    Host(&'a [u8]),
    /// Owned host bytes.
    Owned(Vec<u8>),
    /// Linear memory read at execution time.
    Device {
        /// Start of the source range.
        ptr: DevicePtr,
        /// Length in bytes.
        len: usize,
    },
}

impl FillSource<'_> {
    /// Number of source bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Host(bytes) => bytes.len(),
            Self::Owned(bytes) => bytes.len(),
            Self::Device { len, .. } => *len,
        }
    }

    /// Check for an empty source.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn stage(self) -> Payload {
        match self {
            Self::Host(bytes) => Payload::Bytes(bytes.to_vec()),
            Self::Owned(bytes) => Payload::Bytes(bytes),
            Self::Device { ptr, len } => Payload::Device { ptr, len },
        }
    }
}

/// A fill source captured by a queued command.
pub(crate) enum Payload {
    Bytes(Vec<u8>),
    Device { ptr: DevicePtr, len: usize },
}

impl Payload {
    pub(crate) fn into_bytes(self, backend: &dyn DeviceBackend) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Device { ptr, len } => backend.read_linear(ptr, len),
        }
    }
}

/// Memory acquisition policy.
///
/// `queue` orders the operation on a command queue where the policy supports
/// it; policies that act immediately ignore it.
pub trait MemoryAllocator: Send + Sync {
    /// Allocate `size` bytes.
    fn allocate(&self, size: usize, queue: Option<&CommandQueue>) -> Result<Allocation>;

    /// Release an allocation.
    fn free(&self, allocation: Allocation, queue: Option<&CommandQueue>) -> Result<()>;

    /// Set `size` bytes of an allocation to `value`.
    fn set(
        &self,
        allocation: Allocation,
        value: u8,
        size: usize,
        queue: Option<&CommandQueue>,
    ) -> Result<()>;

    /// Whether allocations are opaque handles rather than pointers.
    fn allocation_is_handle(&self) -> bool {
        false
    }
}

fn expect_pointer(allocation: Allocation) -> Result<DevicePtr> {
    allocation.as_ptr().ok_or_else(|| {
        GpuError::InvalidArgument("linear allocator given a tile pool handle".into())
    })
}

fn set_linear(context: &GpuContext, ptr: DevicePtr, value: u8, size: usize) -> Result<()> {
    context.backend().fill_linear(ptr, value, size)
}

/// Ordinary host memory.
pub struct HostAllocator {
    context: Arc<GpuContext>,
}

impl HostAllocator {
    /// Create a host allocator in the context's address space.
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }
}

impl MemoryAllocator for HostAllocator {
    fn allocate(&self, size: usize, _queue: Option<&CommandQueue>) -> Result<Allocation> {
        let ptr = self.context.backend().allocate_linear(MemorySpace::Host, size)?;
        Ok(Allocation::Pointer(ptr))
    }

    fn free(&self, allocation: Allocation, _queue: Option<&CommandQueue>) -> Result<()> {
        self.context.backend().free_linear(expect_pointer(allocation)?)
    }

    fn set(&self, allocation: Allocation, value: u8, size: usize, _queue: Option<&CommandQueue>) -> Result<()> {
        set_linear(&self.context, expect_pointer(allocation)?, value, size)
    }
}

/// Page-locked host memory.
pub struct PinnedAllocator {
    context: Arc<GpuContext>,
}

impl PinnedAllocator {
    /// Create a pinned allocator in the context's address space.
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }
}

impl MemoryAllocator for PinnedAllocator {
    fn allocate(&self, size: usize, _queue: Option<&CommandQueue>) -> Result<Allocation> {
        let ptr = self.context.backend().allocate_linear(MemorySpace::Pinned, size)?;
        Ok(Allocation::Pointer(ptr))
    }

    fn free(&self, allocation: Allocation, _queue: Option<&CommandQueue>) -> Result<()> {
        self.context.backend().free_linear(expect_pointer(allocation)?)
    }

    fn set(&self, allocation: Allocation, value: u8, size: usize, _queue: Option<&CommandQueue>) -> Result<()> {
        set_linear(&self.context, expect_pointer(allocation)?, value, size)
    }
}

/// Device memory with blocking allocation.
pub struct DeviceAllocator {
    context: Arc<GpuContext>,
}

impl DeviceAllocator {
    /// Create a device allocator bound to `context`.
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }
}

impl MemoryAllocator for DeviceAllocator {
    fn allocate(&self, size: usize, _queue: Option<&CommandQueue>) -> Result<Allocation> {
        check_context(self.context.id())?;
        let ptr = self.context.backend().allocate_linear(MemorySpace::Device, size)?;
        Ok(Allocation::Pointer(ptr))
    }

    fn free(&self, allocation: Allocation, _queue: Option<&CommandQueue>) -> Result<()> {
        check_context(self.context.id())?;
        self.context.backend().free_linear(expect_pointer(allocation)?)
    }

    fn set(&self, allocation: Allocation, value: u8, size: usize, _queue: Option<&CommandQueue>) -> Result<()> {
        check_context(self.context.id())?;
        set_linear(&self.context, expect_pointer(allocation)?, value, size)
    }
}

/// Device memory from a queue-ordered pool.
///
/// Without memory pool support on the device, or without a queue, every call
/// takes the blocking path.
pub struct DeviceAsyncAllocator {
    context: Arc<GpuContext>,
}

impl DeviceAsyncAllocator {
    /// Create an asynchronous device allocator bound to `context`.
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }

    fn ordering_queue<'q>(&self, queue: Option<&'q CommandQueue>) -> Option<&'q CommandQueue> {
        queue.filter(|_| self.context.capabilities().supports_memory_pools)
    }
}

impl MemoryAllocator for DeviceAsyncAllocator {
    fn allocate(&self, size: usize, _queue: Option<&CommandQueue>) -> Result<Allocation> {
        check_context(self.context.id())?;
        // Pool memory is usable by anything issued after the allocation.
        let ptr = self.context.backend().allocate_linear(MemorySpace::Device, size)?;
        Ok(Allocation::Pointer(ptr))
    }

    fn free(&self, allocation: Allocation, queue: Option<&CommandQueue>) -> Result<()> {
        check_context(self.context.id())?;
        let ptr = expect_pointer(allocation)?;
        match self.ordering_queue(queue) {
            Some(queue) => {
                let context = Arc::clone(&self.context);
                queue.submit("free_async", move || context.backend().free_linear(ptr));
                Ok(())
            }
            None => self.context.backend().free_linear(ptr),
        }
    }

    fn set(&self, allocation: Allocation, value: u8, size: usize, queue: Option<&CommandQueue>) -> Result<()> {
        check_context(self.context.id())?;
        let ptr = expect_pointer(allocation)?;
        match self.ordering_queue(queue) {
            Some(queue) => {
                let context = Arc::clone(&self.context);
                queue.submit("memset_async", move || set_linear(&context, ptr, value, size));
                Ok(())
            }
            None => set_linear(&self.context, ptr, value, size),
        }
    }
}

/// Tile pools backing sparse textures.
pub struct TextureTileAllocator {
    context: Arc<GpuContext>,
}

impl TextureTileAllocator {
    /// Create a tile pool allocator bound to `context`.
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }

    /// Recommended tile pool size, or `fallback` when the device has no preference.
    pub fn recommended_allocation_size(&self, fallback: usize) -> usize {
        match self.context.capabilities().tile_pool_granularity {
            0 => fallback,
            granularity => granularity,
        }
    }
}

impl MemoryAllocator for TextureTileAllocator {
    fn allocate(&self, size: usize, _queue: Option<&CommandQueue>) -> Result<Allocation> {
        check_context(self.context.id())?;
        let handle = self.context.backend().create_pool(size)?;
        tracing::trace!(handle = handle.raw(), size, "Created tile pool");
        Ok(Allocation::Handle(handle))
    }

    fn free(&self, allocation: Allocation, _queue: Option<&CommandQueue>) -> Result<()> {
        check_context(self.context.id())?;
        let handle = allocation.as_handle().ok_or_else(|| {
            GpuError::InvalidArgument("tile pool allocator given a pointer".into())
        })?;
        self.context.backend().release_pool(handle)
    }

    fn set(&self, _allocation: Allocation, _value: u8, _size: usize, _queue: Option<&CommandQueue>) -> Result<()> {
        Err(GpuError::InvalidArgument("set is not supported on tile pool handles".into()))
    }

    fn allocation_is_handle(&self) -> bool {
        true
    }
}

/// Allocation policy selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// [`HostAllocator`]
    Host,
    /// [`PinnedAllocator`]
    Pinned,
    /// [`DeviceAllocator`]
    Device,
    /// [`DeviceAsyncAllocator`]
    DeviceAsync,
    /// [`TextureTileAllocator`]
    TextureTile,
}

/// Any of the allocation policies.
pub enum AnyAllocator {
    /// Host memory.
    Host(HostAllocator),
    /// Pinned host memory.
    Pinned(PinnedAllocator),
    /// Blocking device memory.
    Device(DeviceAllocator),
    /// Queue-ordered device memory.
    DeviceAsync(DeviceAsyncAllocator),
    /// Tile pools.
    TextureTile(TextureTileAllocator),
}

impl AnyAllocator {
    /// Create the allocator of `kind` for `context`.
    pub fn new(kind: AllocatorKind, context: Arc<GpuContext>) -> Self {
        match kind {
            AllocatorKind::Host => Self::Host(HostAllocator::new(context)),
            AllocatorKind::Pinned => Self::Pinned(PinnedAllocator::new(context)),
            AllocatorKind::Device => Self::Device(DeviceAllocator::new(context)),
            AllocatorKind::DeviceAsync => Self::DeviceAsync(DeviceAsyncAllocator::new(context)),
            AllocatorKind::TextureTile => Self::TextureTile(TextureTileAllocator::new(context)),
        }
    }

    /// Policy of this allocator.
    pub const fn kind(&self) -> AllocatorKind {
        match self {
            Self::Host(_) => AllocatorKind::Host,
            Self::Pinned(_) => AllocatorKind::Pinned,
            Self::Device(_) => AllocatorKind::Device,
            Self::DeviceAsync(_) => AllocatorKind::DeviceAsync,
            Self::TextureTile(_) => AllocatorKind::TextureTile,
        }
    }

    fn inner(&self) -> &dyn MemoryAllocator {
        match self {
            Self::Host(a) => a,
            Self::Pinned(a) => a,
            Self::Device(a) => a,
            Self::DeviceAsync(a) => a,
            Self::TextureTile(a) => a,
        }
    }
}

impl MemoryAllocator for AnyAllocator {
    fn allocate(&self, size: usize, queue: Option<&CommandQueue>) -> Result<Allocation> {
        self.inner().allocate(size, queue)
    }

    fn free(&self, allocation: Allocation, queue: Option<&CommandQueue>) -> Result<()> {
        self.inner().free(allocation, queue)
    }

    fn set(&self, allocation: Allocation, value: u8, size: usize, queue: Option<&CommandQueue>) -> Result<()> {
        self.inner().set(allocation, value, size, queue)
    }

    fn allocation_is_handle(&self) -> bool {
        self.inner().allocation_is_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GpuContextBuilder;

    #[test]
    fn zero_byte_device_allocation_is_null() {
        let context = GpuContextBuilder::new().build().unwrap();
        let allocator = DeviceAllocator::new(Arc::clone(&context));
        let allocation = allocator.allocate(0, None).unwrap();
        assert_eq!(allocation, Allocation::Pointer(DevicePtr::NULL));
        allocator.free(allocation, None).unwrap();
    }

    #[test]
    fn device_budget_is_enforced() {
        let context = GpuContextBuilder::new().device_memory(1 << 20).build().unwrap();
        let allocator = DeviceAllocator::new(Arc::clone(&context));
        let first = allocator.allocate(768 << 10, None).unwrap();
        let err = allocator.allocate(512 << 10, None).unwrap_err();
        assert!(matches!(err, GpuError::OutOfMemory { available, .. } if available == 256 << 10));

        allocator.free(first, None).unwrap();
        assert_eq!(context.memory_usage().device_bytes, 0);
        assert!(allocator.allocate(512 << 10, None).is_ok());
    }

    #[test]
    fn host_memory_is_not_charged_to_device() {
        let context = GpuContextBuilder::new().build().unwrap();
        let host = HostAllocator::new(Arc::clone(&context));
        let pinned = PinnedAllocator::new(Arc::clone(&context));
        let a = host.allocate(100, None).unwrap();
        let b = pinned.allocate(200, None).unwrap();

        let usage = context.memory_usage();
        assert_eq!(usage.device_bytes, 0);
        assert_eq!(usage.host_bytes, 100);
        assert_eq!(usage.pinned_bytes, 200);

        host.set(a, 7, 100, None).unwrap();
        assert_eq!(context.read_memory(a.as_ptr().unwrap(), 100).unwrap(), vec![7; 100]);

        pinned.free(b, None).unwrap();
        assert_eq!(context.memory_usage().pinned_bytes, 0);
        assert_eq!(context.memory_usage().host_bytes, 100);
    }

    #[test]
    fn budget_counts_pools_and_linear_memory() {
        let mut budget = MemoryBudget::new(1 << 20);
        budget.add_pool(512 << 10).unwrap();
        budget.add_linear(MemorySpace::Device, 256 << 10).unwrap();
        budget.add_linear(MemorySpace::Host, 4 << 20).unwrap();
        assert!(matches!(
            budget.add_linear(MemorySpace::Device, 512 << 10),
            Err(GpuError::OutOfMemory { available, .. }) if available == 256 << 10
        ));

        budget.remove_pool(512 << 10);
        let usage = budget.usage();
        assert_eq!(usage.device_bytes, 256 << 10);
        assert_eq!(usage.host_bytes, 4 << 20);
        assert_eq!(usage.num_handles, 0);
    }

    #[test]
    fn device_allocator_checks_context() {
        let context = GpuContextBuilder::new().build().unwrap();
        let allocator = DeviceAllocator::new(Arc::clone(&context));
        let _other = GpuContextBuilder::new().build().unwrap();

        let err = allocator.allocate(64, None).unwrap_err();
        assert!(matches!(err, GpuError::ContextMismatch { .. }));

        context.make_current();
        assert!(allocator.allocate(64, None).is_ok());
    }

    #[test]
    fn async_free_is_queue_ordered() {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("async");
        let allocator = DeviceAsyncAllocator::new(Arc::clone(&context));

        let allocation = allocator.allocate(4096, Some(&queue)).unwrap();
        allocator.set(allocation, 0xab, 4096, Some(&queue)).unwrap();
        allocator.free(allocation, Some(&queue)).unwrap();
        assert_eq!(context.memory_usage().device_bytes, 4096);
        assert_eq!(queue.pending_count(), 2);

        queue.synchronize().unwrap();
        assert_eq!(context.memory_usage().device_bytes, 0);
    }

    #[test]
    fn async_falls_back_without_pools() {
        let context = GpuContextBuilder::new().memory_pools(false).build().unwrap();
        let queue = context.create_queue("async");
        let allocator = DeviceAsyncAllocator::new(Arc::clone(&context));

        let allocation = allocator.allocate(4096, Some(&queue)).unwrap();
        allocator.free(allocation, Some(&queue)).unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(context.memory_usage().device_bytes, 0);
    }

    #[test]
    fn tile_pools_are_handles() {
        let context = GpuContextBuilder::new().tile_pool_granularity(0).build().unwrap();
        let allocator = AnyAllocator::new(AllocatorKind::TextureTile, Arc::clone(&context));
        assert!(allocator.allocation_is_handle());
        assert_eq!(allocator.kind(), AllocatorKind::TextureTile);

        let allocation = allocator.allocate(1 << 16, None).unwrap();
        assert!(allocation.is_handle());
        assert!(allocator.set(allocation, 0, 16, None).is_err());

        context.write_allocation(allocation, 16, &[1, 2, 3]).unwrap();
        let handle = allocation.as_handle().unwrap();
        assert_eq!(context.read_handle(handle, 16, 3).unwrap(), vec![1, 2, 3]);
        assert!(context.read_handle(handle, (1 << 16) - 1, 2).is_err());

        allocator.free(allocation, None).unwrap();
        assert_eq!(context.memory_usage().num_handles, 0);
    }

    #[test]
    fn recommended_size_falls_back() {
        let context = GpuContextBuilder::new().tile_pool_granularity(0).build().unwrap();
        let allocator = TextureTileAllocator::new(Arc::clone(&context));
        assert_eq!(allocator.recommended_allocation_size(8 << 20), 8 << 20);

        let context = GpuContextBuilder::new().tile_pool_granularity(2 << 20).build().unwrap();
        let allocator = TextureTileAllocator::new(context);
        assert_eq!(allocator.recommended_allocation_size(8 << 20), 2 << 20);
    }

    #[test]
    fn pointer_offsets_stay_inside_region() {
        let context = GpuContextBuilder::new().build().unwrap();
        let allocator = DeviceAllocator::new(Arc::clone(&context));
        let ptr = allocator.allocate(64, None).unwrap().as_ptr().unwrap();
        context.write_memory(ptr.offset(60), &[9; 4]).unwrap();
        assert!(context.write_memory(ptr.offset(62), &[9; 4]).is_err());
        assert_eq!(context.read_memory(ptr.offset(60), 4).unwrap(), vec![9; 4]);
    }
}
