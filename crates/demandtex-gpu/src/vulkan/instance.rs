//! Vulkan instance creation and device selection.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::{GpuError, Result};

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance. No surface extensions are needed.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(entry: &ash::Entry, app_name: &str, enable_validation: bool) -> Result<ash::Instance> {
    let app_name = CString::new(app_name).map_err(|e| GpuError::InvalidArgument(e.to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"demandtex")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    #[cfg(target_os = "macos")]
    let extension_names: Vec<*const std::ffi::c_char> = vec![ash::khr::portability_enumeration::NAME.as_ptr()];
    #[cfg(not(target_os = "macos"))]
    let extension_names: Vec<*const std::ffi::c_char> = Vec::new();

    // Only ask for layers that are installed
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<&CStr> = if enable_validation {
        validation_layers()
            .into_iter()
            .filter(|layer| {
                let found = available_layers
                    .iter()
                    .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
                if !found {
                    tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
                }
                found
            })
            .collect()
    } else {
        Vec::new()
    };
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        .map(|device| (unsafe { score_physical_device(instance, device) }, device))
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Unusable devices score below 1.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    // Timeline semaphores and buffer device addresses are Vulkan 1.2
    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 2)
    {
        return -1;
    }

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
    let features = {
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);
        unsafe { instance.get_physical_device_features2(device, &mut features2) };
        features2.features
    };
    if vulkan_1_2_features.timeline_semaphore != vk::TRUE || vulkan_1_2_features.buffer_device_address != vk::TRUE {
        return -1;
    }

    let mut score = 1;

    // Sparse residency matters more than anything else
    if features.sparse_binding == vk::TRUE && features.sparse_residency_image2_d == vk::TRUE {
        score += 10_000;
    }

    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // +1 per GB of device-local memory
    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size >> 30)
        .sum();
    score + vram_gb as i64
}
