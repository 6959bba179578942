//! Vulkan surface creation from window-system handles.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// The surface and its extension loader.
///
/// The platform surface extension (Win32, Xlib, Wayland) is picked by
/// `ash-window` from the raw handles the windowing collaborator provides.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The instance must be valid and the window must outlive the surface.
    pub unsafe fn new<W>(entry: &ash::Entry, instance: &ash::Instance, window: &W) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("no display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("no window handle: {e}")))?;

        let surface = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self { surface, loader })
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The swapchain built on this surface must already be gone.
    pub unsafe fn destroy(&mut self) {
        self.loader.destroy_surface(self.surface, None);
        self.surface = vk::SurfaceKHR::null();
    }
}
