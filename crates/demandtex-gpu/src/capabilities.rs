//! GPU capability description.

use std::ffi::CStr;

use ash::vk;
use demandtex_core::constants::TILE_SIZE_IN_BYTES;

/// Capabilities of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCapabilities {
    /// Device name
    pub device_name: String,
    /// Sparse (tiled residency) texture support
    pub supports_sparse_textures: bool,
    /// Queue-ordered memory pool support
    pub supports_memory_pools: bool,
    /// Device memory budget in bytes
    pub device_memory_bytes: u64,
    /// Recommended tile pool allocation granularity (0 if the device has no recommendation)
    pub tile_pool_granularity: usize,
    /// Largest supported texture extent per side
    pub max_texture_dimension: u32,
}

impl Default for GpuCapabilities {
    fn default() -> Self {
        Self {
            device_name: "demandtex reference device".to_string(),
            supports_sparse_textures: true,
            supports_memory_pools: true,
            device_memory_bytes: 1 << 30,
            tile_pool_granularity: 2 << 20,
            max_texture_dimension: 32768,
        }
    }
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// Sparse textures need sparse residency for 2D images, timeline
    /// semaphores and a queue family that can bind sparse memory. Vulkan has
    /// no queue-ordered allocation, so memory pools are reported missing.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let features = {
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
            features2.features
        };

        let sparse_queue = unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
            .iter()
            .any(|family| family.queue_flags.contains(vk::QueueFlags::SPARSE_BINDING));

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device_memory_bytes: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        Self {
            device_name,
            supports_sparse_textures: features.sparse_binding == vk::TRUE
                && features.sparse_residency_image2_d == vk::TRUE
                && vulkan_1_2_features.timeline_semaphore == vk::TRUE
                && sparse_queue,
            supports_memory_pools: false,
            device_memory_bytes,
            tile_pool_granularity: Self::default().tile_pool_granularity,
            max_texture_dimension: properties.limits.max_image_dimension2_d,
        }
    }

    /// Check if the device can back at least one sparse tile.
    pub fn meets_requirements(&self) -> bool {
        self.device_memory_bytes >= TILE_SIZE_IN_BYTES as u64 && self.max_texture_dimension > 0
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} - sparse textures: {}, memory pools: {} - {} MB",
            self.device_name,
            if self.supports_sparse_textures { "yes" } else { "no" },
            if self.supports_memory_pools { "yes" } else { "no" },
            self.device_memory_bytes / (1024 * 1024),
        )
    }
}
