//! Logical device creation.

use ash::vk;

use crate::error::{GpuError, Result};

/// Vulkan objects that outlive every resource made from them.
///
/// The backend and its timeline both hold this; the device and instance are
/// destroyed once neither needs them.
pub(crate) struct DeviceShared {
    // Entry must be kept alive for the lifetime of the instance
    _entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
}

impl DeviceShared {
    /// Take ownership of a created device.
    pub(crate) fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
    ) -> Self {
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Queue family for transfers and sparse binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueFamily {
    pub(crate) index: u32,
    pub(crate) sparse_binding: bool,
}

/// Pick a family that can copy images and, preferably, bind sparse memory.
pub(crate) fn pick_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamily> {
    let general = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    let usable = |family: &vk::QueueFamilyProperties| family.queue_count > 0 && family.queue_flags.intersects(general);

    let sparse = families
        .iter()
        .position(|family| usable(family) && family.queue_flags.contains(vk::QueueFlags::SPARSE_BINDING));
    match sparse {
        Some(index) => Some(QueueFamily {
            index: index as u32,
            sparse_binding: true,
        }),
        None => families.iter().position(usable).map(|index| QueueFamily {
            index: index as u32,
            sparse_binding: false,
        }),
    }
}

/// Find the queue family to run on.
///
/// # Safety
/// The instance and physical device must be valid.
pub(crate) unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamily> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    pick_queue_family(&families).ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device.
///
/// # Safety
/// The instance and physical device must be valid.
pub(crate) unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    enable_sparse: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .timeline_semaphore(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .sparse_binding(enable_sparse)
        .sparse_residency_image2_d(enable_sparse);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut features2);

    unsafe { instance.create_device(physical_device, &device_create_info, None) }.map_err(GpuError::from)
}
