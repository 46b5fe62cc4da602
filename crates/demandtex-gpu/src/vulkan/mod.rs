//! Vulkan device backend.
//!
//! Sparse textures are `SPARSE_RESIDENCY` images whose tiles and mip tail are
//! bound to tile pools with `vkQueueBindSparse`. Tile pools, linear memory and
//! dense images come from gpu-allocator. Host-side lookups read bound regions
//! back into a cache that binds and uploads invalidate.

mod device;
mod image;
mod instance;
mod memory;
mod submit;

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use demandtex_core::constants::TILE_SIZE_IN_BYTES;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;

use self::device::{create_device, find_queue_family, DeviceShared, QueueFamily};
use self::image::{chain_copies, color_layers, format_of, image_create_info, tile_copy, tile_extent, SparseLayout};
use self::memory::{location_of, GpuAllocator, GpuBuffer};
use self::submit::{Submitter, VulkanTimeline};
use crate::backend::{BackendKind, Binding, DeviceBackend, DeviceTimeline};
use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::memory::{DevicePtr, MemHandle, MemoryBudget, MemorySpace, MemoryUsage};
use crate::texture::{ImageLayout, SparseProperties, SparseRegion, TextureObject, TextureRecord};

const LINEAR_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

struct LinearBuffer {
    space: MemorySpace,
    buffer: GpuBuffer,
}

struct TilePool {
    allocation: Allocation,
    size: usize,
}

struct DeviceImage {
    image: vk::Image,
    /// Backing memory of a dense image.
    allocation: Option<Allocation>,
    sparse: Option<SparseLayout>,
    size: usize,
}

type ReadbackKey = (TextureObject, Option<SparseRegion>);

struct State {
    allocator: GpuAllocator,
    submitter: Submitter,
    budget: MemoryBudget,
    buffers: BTreeMap<u64, LinearBuffer>,
    pools: HashMap<u64, TilePool>,
    next_pool: u64,
    images: HashMap<TextureObject, DeviceImage>,
    readback: HashMap<ReadbackKey, Arc<Vec<u8>>>,
}

impl State {
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(&LinearBuffer, usize)> {
        let (&base, linear) = self
            .buffers
            .range(..=ptr.raw())
            .next_back()
            .ok_or(GpuError::InvalidAddress(ptr.raw()))?;
        let start = (ptr.raw() - base) as usize;
        if (start + len) as u64 > linear.buffer.size {
            return Err(GpuError::InvalidAddress(ptr.raw()));
        }
        Ok((linear, start))
    }

    fn staging(&mut self, size: usize, location: MemoryLocation) -> Result<GpuBuffer> {
        self.allocator
            .create_buffer(size.max(1) as u64, STAGING_USAGE, location, "staging")
    }

    fn upload(&mut self, bytes: &[u8], size: usize) -> Result<GpuBuffer> {
        let mut staging = self.staging(size.max(bytes.len()), MemoryLocation::CpuToGpu)?;
        if let Err(err) = staging.write_bytes(0, bytes) {
            self.allocator.free_buffer(&mut staging)?;
            return Err(err);
        }
        Ok(staging)
    }

    fn submit<F>(&mut self, staging: Vec<GpuBuffer>, record: F) -> Result<u64>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.submitter.submit_commands(&mut self.allocator, staging, record)
    }

    /// Run `record`, wait for it and return the contents of `staging`.
    fn read_back<F>(&mut self, mut staging: GpuBuffer, len: usize, timeline: &VulkanTimeline, record: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let finished = self
            .submit(Vec::new(), |device, cmd| {
                record(device, cmd);
                host_read_barrier(device, cmd);
            })
            .and_then(|value| timeline.wait(value));
        let bytes = finished.and_then(|()| staging.read_bytes(0, len));
        self.allocator.free_buffer(&mut staging)?;
        bytes
    }

    fn image(&self, object: TextureObject) -> Result<&DeviceImage> {
        self.images.get(&object).ok_or(GpuError::InvalidTexture(object.raw()))
    }

    fn invalidate(&mut self, object: TextureObject, region: Option<SparseRegion>) {
        self.readback.remove(&(object, region));
    }
}

/// Order earlier writes before later reads and writes.
fn memory_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Make transfer writes visible to the host.
fn host_read_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// A context's storage on a Vulkan device.
pub(crate) struct VulkanBackend {
    shared: Arc<DeviceShared>,
    capabilities: GpuCapabilities,
    timeline: Arc<VulkanTimeline>,
    pool_memory_type_bits: u32,
    state: Mutex<State>,
}

impl VulkanBackend {
    /// Open the best Vulkan device.
    ///
    /// `restrict` turns the queried capabilities into the ones the context
    /// runs with.
    pub(crate) fn create(
        app_name: &str,
        enable_validation: bool,
        restrict: impl FnOnce(GpuCapabilities) -> GpuCapabilities,
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::UnsupportedFeature(format!("Vulkan is not available: {e}")))?;
        let instance = unsafe { instance::create_instance(&entry, app_name, enable_validation)? };

        let opened = unsafe { open_device(&instance, restrict) };
        let (physical_device, family, capabilities, device) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };
        let sparse = capabilities.supports_sparse_textures;
        let shared = Arc::new(DeviceShared::new(entry, instance, physical_device, device, family.index));
        tracing::info!("Opened Vulkan device: {}", capabilities.summary());

        let timeline = Arc::new(VulkanTimeline::new(Arc::clone(&shared))?);
        let allocator = GpuAllocator::new(Arc::clone(&shared))?;
        let submitter = Submitter::new(Arc::clone(&shared), Arc::clone(&timeline))?;
        let pool_memory_type_bits = if sparse { unsafe { sparse_memory_type_bits(&shared)? } } else { 0 };

        Ok(Self {
            capabilities: capabilities.clone(),
            timeline,
            pool_memory_type_bits,
            state: Mutex::new(State {
                allocator,
                submitter,
                budget: MemoryBudget::new(capabilities.device_memory_bytes),
                buffers: BTreeMap::new(),
                pools: HashMap::new(),
                next_pool: 1,
                images: HashMap::new(),
                readback: HashMap::new(),
            }),
            shared,
        })
    }

    /// Capabilities the context runs with.
    pub(crate) fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    fn check_format_support(&self, format: vk::Format) -> Result<()> {
        let properties = unsafe {
            self.shared.instance.get_physical_device_sparse_image_format_properties(
                self.shared.physical_device,
                format,
                vk::ImageType::TYPE_2D,
                vk::SampleCountFlags::TYPE_1,
                image::IMAGE_USAGE,
                vk::ImageTiling::OPTIMAL,
            )
        };
        if properties.is_empty() {
            return Err(GpuError::UnsupportedFeature(format!("sparse residency for {format:?}")));
        }
        Ok(())
    }

    fn create_sparse_image(&self, layout: &ImageLayout) -> Result<(vk::Image, SparseLayout)> {
        let format = format_of(layout)?;
        self.check_format_support(format)?;
        let create_info = image_create_info(layout, format, true);
        let image = unsafe { self.device().create_image(&create_info, None)? };
        match unsafe { image::query_sparse_layout(self.device(), image, layout) } {
            Ok(sparse) => Ok((image, sparse)),
            Err(err) => {
                unsafe { self.device().destroy_image(image, None) };
                Err(err)
            }
        }
    }

    /// Read a whole region back from the device, through the cache.
    fn region_bytes(
        &self,
        state: &mut State,
        object: TextureObject,
        record: &TextureRecord,
        region: Option<SparseRegion>,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(bytes) = state.readback.get(&(object, region)) {
            return Ok(Arc::clone(bytes));
        }

        let image = state.image(object)?.image;
        let layout = &record.layout;
        let (size, copies) = match (region, record.sparse) {
            (Some(region @ SparseRegion::Tile(coord)), Some(sparse)) => {
                (record.region_size(region)?, vec![tile_copy(layout, sparse.tile_dims, coord)])
            }
            (Some(SparseRegion::MipTail), Some(sparse)) => (
                sparse.mip_tail_size,
                chain_copies(layout, sparse.mip_tail_first_level),
            ),
            (None, None) => (layout.chain_size(), chain_copies(layout, 0)),
            _ => return Err(GpuError::InvalidArgument("region does not match the texture kind".into())),
        };

        let staging = state.staging(size, MemoryLocation::GpuToCpu)?;
        let buffer = staging.buffer;
        let bytes = state.read_back(staging, size, &self.timeline, |device, cmd| unsafe {
            memory_barrier(device, cmd);
            device.cmd_copy_image_to_buffer(cmd, image, vk::ImageLayout::GENERAL, buffer, &copies);
        })?;

        let bytes = Arc::new(bytes);
        state.readback.insert((object, region), Arc::clone(&bytes));
        Ok(bytes)
    }
}

/// Pick a physical device and create its logical device.
///
/// Sparse residency is enabled only when the restricted capabilities and
/// the queue family both allow it.
unsafe fn open_device(
    instance: &ash::Instance,
    restrict: impl FnOnce(GpuCapabilities) -> GpuCapabilities,
) -> Result<(vk::PhysicalDevice, QueueFamily, GpuCapabilities, ash::Device)> {
    let physical_device = unsafe { instance::select_physical_device(instance)? };
    let family = unsafe { find_queue_family(instance, physical_device)? };
    let mut capabilities = restrict(unsafe { GpuCapabilities::query(instance, physical_device) });
    capabilities.supports_sparse_textures &= family.sparse_binding;

    let device = unsafe {
        create_device(
            instance,
            physical_device,
            family.index,
            capabilities.supports_sparse_textures,
        )?
    };
    Ok((physical_device, family, capabilities, device))
}

/// Memory types a sparse image can bind, from a throwaway image.
unsafe fn sparse_memory_type_bits(shared: &DeviceShared) -> Result<u32> {
    let layout = ImageLayout {
        format: demandtex_core::ChannelFormat::U8,
        num_channels: 4,
        levels: demandtex_core::geometry::mip_level_dims(256, 256, 1),
    };
    let create_info = image_create_info(&layout, vk::Format::R8G8B8A8_UNORM, true);
    let image = unsafe { shared.device.create_image(&create_info, None)? };
    let requirements = unsafe { shared.device.get_image_memory_requirements(image) };
    unsafe { shared.device.destroy_image(image, None) };
    Ok(requirements.memory_type_bits)
}

impl DeviceBackend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn usage(&self) -> MemoryUsage {
        self.state.lock().budget.usage()
    }

    fn timeline(&self) -> Arc<dyn DeviceTimeline> {
        self.timeline.clone()
    }

    fn allocate_linear(&self, space: MemorySpace, size: usize) -> Result<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.budget.add_linear(space, size)?;

        let created = state
            .allocator
            .create_buffer(size as u64, LINEAR_USAGE, location_of(space), "linear");
        let mut buffer = match created {
            Ok(buffer) => buffer,
            Err(err) => {
                state.budget.remove_linear(space, size);
                return Err(err);
            }
        };

        // Fresh allocations read as zero, as on the reference device
        let zeroed = if buffer.is_mapped() {
            buffer.write_bytes(0, &vec![0; size]).map(|()| None)
        } else {
            let target = buffer.buffer;
            state
                .submit(Vec::new(), |device, cmd| unsafe {
                    device.cmd_fill_buffer(cmd, target, 0, vk::WHOLE_SIZE, 0);
                })
                .map(Some)
        };
        if let Err(err) = zeroed {
            state.allocator.free_buffer(&mut buffer)?;
            state.budget.remove_linear(space, size);
            return Err(err);
        }

        let address = buffer.device_address(self.device());
        state.buffers.insert(address, LinearBuffer { space, buffer });
        Ok(DevicePtr::from_raw(address))
    }

    fn free_linear(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut linear = state
            .buffers
            .remove(&ptr.raw())
            .ok_or(GpuError::InvalidAddress(ptr.raw()))?;
        state.submitter.finish()?;
        state.allocator.free_buffer(&mut linear.buffer)?;
        state.budget.remove_linear(linear.space, linear.buffer.size as usize);
        Ok(())
    }

    fn read_linear(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (linear, offset) = state.locate(ptr, len)?;
        if linear.buffer.is_mapped() {
            state.submitter.finish()?;
            let (linear, offset) = state.locate(ptr, len)?;
            return linear.buffer.read_bytes(offset, len);
        }

        let source = linear.buffer.buffer;
        let staging = state.staging(len, MemoryLocation::GpuToCpu)?;
        let target = staging.buffer;
        let region = vk::BufferCopy::default()
            .src_offset(offset as u64)
            .dst_offset(0)
            .size(len as u64);
        state.read_back(staging, len, &self.timeline, |device, cmd| unsafe {
            memory_barrier(device, cmd);
            device.cmd_copy_buffer(cmd, source, target, &[region]);
        })
    }

    fn write_linear(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (linear, offset) = state.locate(ptr, bytes.len())?;
        if linear.buffer.is_mapped() {
            state.submitter.finish()?;
            let base = ptr.raw() - offset as u64;
            let linear = state
                .buffers
                .get_mut(&base)
                .ok_or(GpuError::InvalidAddress(ptr.raw()))?;
            return linear.buffer.write_bytes(offset, bytes);
        }

        let target = linear.buffer.buffer;
        let staging = state.upload(bytes, bytes.len())?;
        let source = staging.buffer;
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(offset as u64)
            .size(bytes.len() as u64);
        state.submit(vec![staging], |device, cmd| unsafe {
            memory_barrier(device, cmd);
            device.cmd_copy_buffer(cmd, source, target, &[region]);
        })?;
        Ok(())
    }

    fn fill_linear(&self, ptr: DevicePtr, value: u8, len: usize) -> Result<()> {
        self.write_linear(ptr, &vec![value; len])
    }

    fn create_pool(&self, size: usize) -> Result<MemHandle> {
        if size == 0 {
            return Err(GpuError::InvalidArgument("empty tile pool".into()));
        }
        if !self.capabilities.supports_sparse_textures {
            return Err(GpuError::UnsupportedFeature("tile pools need sparse textures".into()));
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.budget.add_pool(size)?;

        let requirements = vk::MemoryRequirements {
            size: size as u64,
            alignment: TILE_SIZE_IN_BYTES as u64,
            memory_type_bits: self.pool_memory_type_bits,
        };
        let allocation = match state
            .allocator
            .allocate(requirements, MemoryLocation::GpuOnly, false, "tile pool")
        {
            Ok(allocation) => allocation,
            Err(err) => {
                state.budget.remove_pool(size);
                return Err(err);
            }
        };

        let handle = state.next_pool;
        state.next_pool += 1;
        state.pools.insert(handle, TilePool { allocation, size });
        Ok(MemHandle::from_raw(handle))
    }

    fn release_pool(&self, handle: MemHandle) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pool = state
            .pools
            .remove(&handle.raw())
            .ok_or(GpuError::InvalidHandle(handle.raw()))?;
        state.submitter.finish()?;
        state.allocator.free(pool.allocation)?;
        state.budget.remove_pool(pool.size);
        Ok(())
    }

    fn read_pool(&self, _handle: MemHandle, _offset: usize, _len: usize) -> Result<Vec<u8>> {
        Err(GpuError::UnsupportedFeature("tile pools are not host accessible".into()))
    }

    fn write_pool(&self, _handle: MemHandle, _offset: usize, _bytes: &[u8]) -> Result<()> {
        Err(GpuError::UnsupportedFeature("tile pools are not host accessible".into()))
    }

    fn sparse_properties(&self, layout: &ImageLayout) -> Result<SparseProperties> {
        let (image, sparse) = self.create_sparse_image(layout)?;
        unsafe { self.device().destroy_image(image, None) };
        Ok(sparse.properties)
    }

    fn create_image(&self, object: TextureObject, layout: &ImageLayout, sparse: Option<&SparseProperties>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let image = match sparse {
            Some(properties) => {
                let (image, sparse) = self.create_sparse_image(layout)?;
                if sparse.properties != *properties {
                    unsafe { self.device().destroy_image(image, None) };
                    return Err(GpuError::InvalidArgument("sparse properties changed between queries".into()));
                }
                DeviceImage {
                    image,
                    allocation: None,
                    sparse: Some(sparse),
                    size: 0,
                }
            }
            None => {
                let format = format_of(layout)?;
                let size = layout.chain_size();
                state.budget.charge(size)?;
                let create_info = image_create_info(layout, format, false);
                let image = match unsafe { self.device().create_image(&create_info, None) } {
                    Ok(image) => image,
                    Err(err) => {
                        state.budget.release(size);
                        return Err(err.into());
                    }
                };
                match state.allocator.bind_image(image, "dense texture") {
                    Ok(allocation) => DeviceImage {
                        image,
                        allocation: Some(allocation),
                        sparse: None,
                        size,
                    },
                    Err(err) => {
                        unsafe { self.device().destroy_image(image, None) };
                        state.budget.release(size);
                        return Err(err);
                    }
                }
            }
        };

        // Images stay in GENERAL so copies in both directions need no transitions
        let handle = image.image;
        let levels = layout.levels.len() as u32;
        state.images.insert(object, image);
        state.submit(Vec::new(), |device, cmd| unsafe {
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(handle)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: levels,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })?;
        Ok(())
    }

    fn destroy_image(&self, object: TextureObject, _record: &TextureRecord) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(image) = state.images.remove(&object) else {
            return Ok(());
        };
        state.readback.retain(|(owner, _), _| *owner != object);
        state.submitter.finish()?;
        unsafe { self.device().destroy_image(image.image, None) };
        if let Some(allocation) = image.allocation {
            state.allocator.free(allocation)?;
            state.budget.release(image.size);
        }
        Ok(())
    }

    fn bind_region(
        &self,
        object: TextureObject,
        record: &TextureRecord,
        region: SparseRegion,
        binding: Binding,
        size: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let image = state.image(object)?;
        let handle = image.image;
        let sparse = image
            .sparse
            .ok_or_else(|| GpuError::InvalidArgument("texture is not sparse".into()))?;
        let pool = state
            .pools
            .get(&binding.handle.raw())
            .ok_or(GpuError::InvalidHandle(binding.handle.raw()))?;
        if binding.offset + size > pool.size {
            return Err(GpuError::InvalidArgument(format!(
                "range {}+{size} outside tile pool of {} bytes",
                binding.offset, pool.size
            )));
        }
        let memory = unsafe { pool.allocation.memory() };
        let memory_offset = pool.allocation.offset() + binding.offset as u64;

        let layout = &record.layout;
        let copies = match region {
            SparseRegion::Tile(coord) => {
                let (offset, extent) = tile_extent(layout, sparse.properties.tile_dims, coord);
                let bind = vk::SparseImageMemoryBind::default()
                    .subresource(vk::ImageSubresource {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: coord.mip,
                        array_layer: 0,
                    })
                    .offset(offset)
                    .extent(extent)
                    .memory(memory)
                    .memory_offset(memory_offset);
                state.submitter.bind_sparse(&mut state.allocator, handle, &[bind], &[])?;
                vec![tile_copy(layout, sparse.properties.tile_dims, coord)]
            }
            SparseRegion::MipTail => {
                let bind = vk::SparseMemoryBind::default()
                    .resource_offset(sparse.mip_tail_offset)
                    .size(sparse.device_tail_size)
                    .memory(memory)
                    .memory_offset(memory_offset);
                state.submitter.bind_sparse(&mut state.allocator, handle, &[], &[bind])?;
                chain_copies(layout, sparse.properties.mip_tail_first_level)
            }
        };
        state.invalidate(object, Some(region));

        if bytes.is_empty() {
            return Ok(());
        }
        let staging = state.upload(bytes, size)?;
        let source = staging.buffer;
        state.submit(vec![staging], |device, cmd| unsafe {
            memory_barrier(device, cmd);
            device.cmd_copy_buffer_to_image(cmd, source, handle, vk::ImageLayout::GENERAL, &copies);
        })?;
        Ok(())
    }

    fn unbind_region(&self, object: TextureObject, record: &TextureRecord, region: SparseRegion) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let image = state.image(object)?;
        let handle = image.image;
        let sparse = image
            .sparse
            .ok_or_else(|| GpuError::InvalidArgument("texture is not sparse".into()))?;

        match region {
            SparseRegion::Tile(coord) => {
                let (offset, extent) = tile_extent(&record.layout, sparse.properties.tile_dims, coord);
                let bind = vk::SparseImageMemoryBind::default()
                    .subresource(vk::ImageSubresource {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: coord.mip,
                        array_layer: 0,
                    })
                    .offset(offset)
                    .extent(extent)
                    .memory(vk::DeviceMemory::null());
                state.submitter.bind_sparse(&mut state.allocator, handle, &[bind], &[])?;
            }
            SparseRegion::MipTail => {
                let bind = vk::SparseMemoryBind::default()
                    .resource_offset(sparse.mip_tail_offset)
                    .size(sparse.device_tail_size)
                    .memory(vk::DeviceMemory::null());
                state.submitter.bind_sparse(&mut state.allocator, handle, &[], &[bind])?;
            }
        }
        state.invalidate(object, Some(region));
        Ok(())
    }

    fn write_image(&self, object: TextureObject, record: &TextureRecord, bytes: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let handle = state.image(object)?.image;
        let size = record.layout.chain_size();
        let copies = chain_copies(&record.layout, 0);
        let staging = state.upload(bytes, size)?;
        let source = staging.buffer;
        state.submit(vec![staging], |device, cmd| unsafe {
            memory_barrier(device, cmd);
            device.cmd_copy_buffer_to_image(cmd, source, handle, vk::ImageLayout::GENERAL, &copies);
        })?;
        state.invalidate(object, None);
        Ok(())
    }

    fn read_texel(
        &self,
        object: TextureObject,
        record: &TextureRecord,
        region: Option<SparseRegion>,
        offset: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let bytes = {
            let mut guard = self.state.lock();
        let state = &mut *guard;
            self.region_bytes(state, object, record, region)?
        };
        let texel = bytes
            .get(offset..offset + out.len())
            .ok_or_else(|| GpuError::InvalidArgument(format!("texel at {offset} outside the region")))?;
        out.copy_from_slice(texel);
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        unsafe {
            let _ = self.shared.device.device_wait_idle();
        }
        for (_, image) in state.images.drain() {
            unsafe { self.shared.device.destroy_image(image.image, None) };
            if let Some(allocation) = image.allocation {
                let _ = state.allocator.free(allocation);
            }
        }
        for (_, mut linear) in std::mem::take(&mut state.buffers) {
            let _ = state.allocator.free_buffer(&mut linear.buffer);
        }
        for (_, pool) in state.pools.drain() {
            let _ = state.allocator.free(pool.allocation);
        }
        state.submitter.destroy(&mut state.allocator);

        // Free all device memory before the device goes away
        state.allocator.shutdown();
    }
}
