//! Device memory through gpu-allocator.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;

use super::device::DeviceShared;
use crate::error::{GpuError, Result};
use crate::memory::MemorySpace;

/// Where each linear memory space lives on the device.
pub(crate) const fn location_of(space: MemorySpace) -> MemoryLocation {
    match space {
        MemorySpace::Host => MemoryLocation::GpuToCpu,
        MemorySpace::Pinned => MemoryLocation::CpuToGpu,
        MemorySpace::Device => MemoryLocation::GpuOnly,
    }
}

/// GPU memory allocator wrapper.
pub(crate) struct GpuAllocator {
    allocator: Option<Allocator>,
    shared: Arc<DeviceShared>,
}

impl GpuAllocator {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: shared.instance.clone(),
            device: shared.device.clone(),
            physical_device: shared.physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            shared,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidArgument("allocator already shut down".into()))
    }

    /// Allocate raw memory, e.g. a tile pool.
    pub(crate) fn allocate(
        &mut self,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        name: &str,
    ) -> Result<Allocation> {
        self.inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Return memory to the allocator.
    pub(crate) fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Allocate a buffer.
    pub(crate) fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let device = &self.shared.device;
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(requirements, location, true, name) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.shared.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let bound = unsafe {
            self.shared
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            unsafe { self.shared.device.destroy_buffer(buffer, None) };
            self.free(allocation)?;
            return Err(err.into());
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Free a buffer allocation.
    pub(crate) fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.free(allocation)?;
        }
        unsafe { self.shared.device.destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();
        Ok(())
    }

    /// Allocate and bind memory for a non-sparse image.
    pub(crate) fn bind_image(&mut self, image: vk::Image, name: &str) -> Result<Allocation> {
        let requirements = unsafe { self.shared.device.get_image_memory_requirements(image) };
        let allocation = self.allocate(requirements, MemoryLocation::GpuOnly, false, name)?;
        let bound = unsafe {
            self.shared
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            self.free(allocation)?;
            return Err(err.into());
        }
        Ok(allocation)
    }

    /// Shut down the allocator, freeing all GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed. Remaining
    /// allocations are freed and logged as leaks.
    pub(crate) fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub(crate) struct GpuBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
}

impl GpuBuffer {
    /// Get the device address of this buffer.
    pub(crate) fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Check whether the host can map the buffer.
    pub(crate) fn is_mapped(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.mapped_ptr().is_some())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidArgument("offset overflow".into()))?;
        if end as u64 > self.size {
            return Err(GpuError::InvalidArgument(format!(
                "range {offset}+{len} outside buffer of {} bytes",
                self.size
            )));
        }
        Ok(())
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub(crate) fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| GpuError::InvalidArgument("buffer not mapped".into()))?;
        mapped[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read raw bytes at `offset` (must be host-visible).
    pub(crate) fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| GpuError::InvalidArgument("buffer not mapped".into()))?;
        Ok(mapped[offset..offset + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_spaces_map_to_locations() {
        assert_eq!(location_of(MemorySpace::Host), MemoryLocation::GpuToCpu);
        assert_eq!(location_of(MemorySpace::Pinned), MemoryLocation::CpuToGpu);
        assert_eq!(location_of(MemorySpace::Device), MemoryLocation::GpuOnly);
    }
}
