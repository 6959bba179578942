//! Validation layer messenger and debug object names.
//!
//! When validation is off every call here is a no-op, so the rest of the
//! crate can name objects unconditionally.

use crate::error::Result;
use ash::vk;
use std::ffi::{c_void, CStr, CString};

/// Debug utils wrapper. Routes validation messages into `tracing` and
/// attaches debug names to Vulkan objects.
pub struct DebugUtils {
    instance_fn: Option<ash::ext::debug_utils::Instance>,
    device_fn: Option<ash::ext::debug_utils::Device>,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugUtils {
    /// Create the messenger. With `enabled == false` a disabled wrapper is
    /// returned and no extension functions are loaded.
    ///
    /// # Safety
    /// The entry and instance must be valid, and the instance must have been
    /// created with `VK_EXT_debug_utils` when `enabled` is true.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }

        let instance_fn = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = instance_fn.create_debug_utils_messenger(&create_info, None)?;

        Ok(Self {
            instance_fn: Some(instance_fn),
            device_fn: None,
            messenger,
        })
    }

    /// A wrapper with everything disabled.
    pub fn disabled() -> Self {
        Self {
            instance_fn: None,
            device_fn: None,
            messenger: vk::DebugUtilsMessengerEXT::null(),
        }
    }

    /// Load the device-level naming functions. Must be called once after
    /// device creation for `set_object_name` to take effect.
    pub fn attach_device(&mut self, instance: &ash::Instance, device: &ash::Device) {
        if self.instance_fn.is_some() {
            self.device_fn = Some(ash::ext::debug_utils::Device::new(instance, device));
        }
    }

    /// Attach a debug name to a Vulkan object. No-op when validation is off.
    pub fn set_object_name<T: vk::Handle>(&self, object: T, name: &str) {
        let Some(device_fn) = &self.device_fn else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };

        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name);

        // Naming failures are not worth surfacing to the caller.
        if let Err(e) = unsafe { device_fn.set_debug_utils_object_name(&info) } {
            tracing::debug!("failed to set debug name: {e}");
        }
    }

    /// Destroy the messenger.
    ///
    /// # Safety
    /// Must be called before the instance is destroyed, and nothing may use
    /// this wrapper afterwards.
    pub unsafe fn destroy(&mut self) {
        if let Some(instance_fn) = &self.instance_fn {
            if self.messenger != vk::DebugUtilsMessengerEXT::null() {
                instance_fn.destroy_debug_utils_messenger(self.messenger, None);
                self.messenger = vk::DebugUtilsMessengerEXT::null();
            }
        }
        self.instance_fn = None;
        self.device_fn = None;
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        "<no message>".into()
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    match severity {
        s if s.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) => {
            tracing::error!(target: "ember_gpu::validation", ?message_type, "{message}");
        }
        s if s.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) => {
            tracing::warn!(target: "ember_gpu::validation", ?message_type, "{message}");
        }
        s if s.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) => {
            tracing::debug!(target: "ember_gpu::validation", ?message_type, "{message}");
        }
        _ => {
            tracing::trace!(target: "ember_gpu::validation", ?message_type, "{message}");
        }
    }

    vk::FALSE
}
