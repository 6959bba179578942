//! Vulkan instance creation and physical device selection.

use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};

/// Hardware preference for physical device selection.
///
/// `Software` means "no preference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HardwareType {
    #[default]
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Software,
}

impl HardwareType {
    fn matches(self, device_type: vk::PhysicalDeviceType) -> bool {
        match self {
            HardwareType::Discrete => device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
            HardwareType::Integrated => device_type == vk::PhysicalDeviceType::INTEGRATED_GPU,
            HardwareType::Virtual => device_type == vk::PhysicalDeviceType::VIRTUAL_GPU,
            HardwareType::Cpu => device_type == vk::PhysicalDeviceType::CPU,
            HardwareType::Software => true,
        }
    }
}

/// Instance extensions this backend asks for.
pub fn required_instance_extensions(enable_validation: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
    ];

    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }

    extensions
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan 1.3 instance.
///
/// Validation is requested, not demanded: when the layer is missing,
/// `enable_validation` is downgraded to false with a warning. Unavailable
/// instance extensions are likewise logged and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: &mut bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name).unwrap_or_default();
    let engine_name = c"Ember";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    // Downgrade validation when the layer is not installed.
    if *enable_validation {
        let available_layers = entry.enumerate_instance_layer_properties()?;
        let found = available_layers.iter().any(|props| {
            CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER
        });
        if !found {
            tracing::warn!(
                "validation layer {:?} not available, continuing without it",
                VALIDATION_LAYER
            );
            *enable_validation = false;
        }
    }

    // Only request extensions the driver actually exposes.
    let available: HashSet<String> = entry
        .enumerate_instance_extension_properties(None)?
        .iter()
        .filter_map(|props| {
            CStr::from_ptr(props.extension_name.as_ptr())
                .to_str()
                .ok()
                .map(String::from)
        })
        .collect();

    // The messenger needs the debug utils extension.
    if *enable_validation && !available.contains("VK_EXT_debug_utils") {
        tracing::warn!("VK_EXT_debug_utils not available, continuing without validation output");
        *enable_validation = false;
    }

    let layer_names: Vec<*const c_char> = if *enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let mut extension_names: Vec<*const c_char> = Vec::new();
    for ext in required_instance_extensions(*enable_validation) {
        if available.contains(ext.to_str().unwrap_or_default()) {
            extension_names.push(ext.as_ptr());
        } else {
            tracing::warn!("instance extension {ext:?} is not available on this device");
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    let instance = entry.create_instance(&create_info, None)?;
    Ok(instance)
}

/// Select a physical device honoring the hardware preference.
///
/// Devices of the preferred type are considered first; when none of them
/// qualifies the search widens to every device with a warning. A device
/// qualifies only if it meets the Vulkan 1.3 feature requirements.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    preferred: HardwareType,
) -> Result<(vk::PhysicalDevice, DeviceCapabilities)> {
    let devices = instance.enumerate_physical_devices()?;
    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let pick = |candidates: &[vk::PhysicalDevice]| -> Option<(vk::PhysicalDevice, DeviceCapabilities)> {
        let mut best: Option<(vk::PhysicalDevice, DeviceCapabilities, i64)> = None;
        for &device in candidates {
            let caps = DeviceCapabilities::query(instance, device);
            if !caps.meets_requirements() {
                tracing::debug!("skipping {}: missing required features", caps.summary());
                continue;
            }
            let score = score_device(&caps);
            if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
                best = Some((device, caps, score));
            }
        }
        best.map(|(device, caps, _)| (device, caps))
    };

    let matching: Vec<vk::PhysicalDevice> = devices
        .iter()
        .copied()
        .filter(|&device| {
            let props = instance.get_physical_device_properties(device);
            preferred.matches(props.device_type)
        })
        .collect();

    if let Some(found) = pick(&matching) {
        return Ok(found);
    }

    if preferred != HardwareType::Software {
        tracing::warn!(
            "no suitable {preferred:?} device found, considering all hardware types"
        );
        if let Some(found) = pick(&devices) {
            return Ok(found);
        }
    }

    Err(GpuError::NoSuitableDevice)
}

fn score_device(caps: &DeviceCapabilities) -> i64 {
    let mut score: i64 = match caps.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB of VRAM
    score += (caps.device_local_memory_mb / 1024) as i64;
    score
}

/// Queues owned by the context. Graphics is mandatory; its family must also
/// support presentation, which the swapchain verifies against the surface.
pub struct DeviceQueues {
    pub graphics_family: u32,
    pub graphics: vk::Queue,
}

/// Create the logical device with the Vulkan 1.3 feature set this backend
/// depends on, and fetch the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(ash::Device, DeviceQueues)> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let graphics_family = queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .ok_or(GpuError::NoSuitableDevice)? as u32;

    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;
    let graphics = device.get_device_queue(graphics_family, 0);

    Ok((
        device,
        DeviceQueues {
            graphics_family,
            graphics,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_preference_matches_everything() {
        for ty in [
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::OTHER,
        ] {
            assert!(HardwareType::Software.matches(ty));
        }
    }

    #[test]
    fn discrete_preference_is_exact() {
        assert!(HardwareType::Discrete.matches(vk::PhysicalDeviceType::DISCRETE_GPU));
        assert!(!HardwareType::Discrete.matches(vk::PhysicalDeviceType::INTEGRATED_GPU));
        assert!(!HardwareType::Discrete.matches(vk::PhysicalDeviceType::CPU));
    }
}
