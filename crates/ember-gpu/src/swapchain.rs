//! Swapchain: surface images, per-image acquire semaphores, and per-image
//! timeline pacing values.
//!
//! The CPU is kept at most `num_images - 1` frames ahead of the GPU: before
//! an image slot is reused, the context's timeline semaphore is waited for
//! the value signaled by the last submission that presented that image.

use crate::command::CommandPool;
use crate::debug::DebugUtils;
use crate::error::{GpuError, Result};
use crate::image::{Image, ImageDescription, ImageType};
use crate::pool::{Pool, TextureHandle, TextureTag};
use ash::vk;
use std::sync::Arc;

/// Upper bound on swapchain images the backend will adopt.
pub const MAX_SWAPCHAIN_IMAGES: usize = 16;

/// Color space the consumer wants the swapchain in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    /// Perceptual sRGB; the default.
    #[default]
    SrgbNonLinear,
    /// Linear; mapped to the closest linear space the surface offers.
    SrgbLinear,
}

/// Pick the surface format: exact (format, color space) match for the
/// desired space first, then format-only match, then whatever is first.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    desired: ColorSpace,
) -> vk::SurfaceFormatKHR {
    let preferred = match desired {
        ColorSpace::SrgbNonLinear => vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
        // BT709 linear is the closest space to linear.
        ColorSpace::SrgbLinear => vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::BT709_LINEAR_EXT,
        },
    };

    if let Some(format) = available
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
    {
        return *format;
    }

    if let Some(format) = available.iter().find(|f| f.format == preferred.format) {
        return *format;
    }

    available[0]
}

/// Present mode this platform prefers: immediate on Linux window systems,
/// mailbox on Windows, FIFO everywhere else.
pub fn preferred_present_mode() -> vk::PresentModeKHR {
    #[cfg(target_os = "linux")]
    {
        vk::PresentModeKHR::IMMEDIATE
    }
    #[cfg(target_os = "windows")]
    {
        vk::PresentModeKHR::MAILBOX
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        vk::PresentModeKHR::FIFO
    }
}

/// The preferred mode when the surface offers it, FIFO (always available)
/// otherwise.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Number of swapchain images to adopt.
pub fn clamp_image_count(count: u32) -> u32 {
    count.min(MAX_SWAPCHAIN_IMAGES as u32)
}

pub(crate) struct SwapchainDescription<'a> {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: &'a ash::khr::surface::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_family: u32,
    pub graphics_queue: vk::Queue,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
}

/// Owns the surface swapchain and the per-image pacing state.
pub struct Swapchain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    graphics_queue: vk::Queue,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    pub(crate) textures: Vec<TextureHandle>,
    /// One acquire semaphore per image slot.
    acquire_semaphores: Vec<vk::Semaphore>,
    /// Timeline value that must be reached before the image slot is reused.
    pub(crate) timeline_wait_values: Vec<u64>,
    pub(crate) current_image_index: u32,
    pub(crate) current_frame: u64,
    /// Raised by present; the next `current_texture` acquires.
    needs_acquire: bool,
    num_images: u32,
}

impl Swapchain {
    /// Create the swapchain and adopt its images into the texture pool.
    ///
    /// # Safety
    /// All handles in the description must be valid.
    pub(crate) unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        debug: &DebugUtils,
        textures: &mut Pool<Image, TextureTag>,
        desc: &SwapchainDescription,
    ) -> Result<Self> {
        let surface_loader = desc.surface_loader;

        let supports_present = surface_loader.get_physical_device_surface_support(
            desc.physical_device,
            desc.graphics_family,
            desc.surface,
        )?;
        if !supports_present {
            return Err(GpuError::SwapchainCreation(
                "graphics queue family cannot present to this surface".into(),
            ));
        }

        let capabilities = surface_loader
            .get_physical_device_surface_capabilities(desc.physical_device, desc.surface)?;
        let formats = surface_loader
            .get_physical_device_surface_formats(desc.physical_device, desc.surface)?;
        let present_modes = surface_loader
            .get_physical_device_surface_present_modes(desc.physical_device, desc.surface)?;

        let surface_format = select_surface_format(&formats, desc.color_space);
        let present_mode = select_present_mode(&present_modes, preferred_present_mode());

        // Storage usage only when both the surface and the format support it.
        let format_properties = instance
            .get_physical_device_format_properties(desc.physical_device, surface_format.format);
        let storage_supported = capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::STORAGE)
            && format_properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::STORAGE_IMAGE);

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        if storage_supported {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let composite_alpha = if capabilities
            .supported_composite_alpha
            .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
        {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        } else {
            vk::CompositeAlphaFlagsKHR::INHERIT
        };

        let queue_families = [desc.graphics_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(capabilities.min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk::Extent2D {
                width: desc.width,
                height: desc.height,
            })
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true);

        let loader = ash::khr::swapchain::Device::new(instance, &device);
        let raw = loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        debug.set_object_name(raw, "swapchain");

        let images = loader.get_swapchain_images(raw)?;
        let num_images = clamp_image_count(images.len() as u32);
        if num_images == 0 {
            return Err(GpuError::SwapchainCreation("swapchain has no images".into()));
        }

        tracing::info!(
            "swapchain: {num_images} images, {:?} / {:?}, present mode {:?}",
            surface_format.format,
            surface_format.color_space,
            present_mode,
        );

        let mut acquire_semaphores = Vec::with_capacity(num_images as usize);
        let mut texture_handles = Vec::with_capacity(num_images as usize);

        for (i, &image) in images.iter().take(num_images as usize).enumerate() {
            acquire_semaphores.push(crate::sync::create_semaphore(
                &device,
                debug,
                &format!("swapchain acquire semaphore {i}"),
            )?);

            let adopted = Image::adopt(
                &device,
                debug,
                &ImageDescription {
                    raw: image,
                    usage,
                    extent: vk::Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth: 1,
                    },
                    image_type: ImageType::SwapChain,
                    format: surface_format.format,
                    levels: 1,
                    layers: 1,
                    debug_name: &format!("swapchain image {i}"),
                },
            )?;
            texture_handles.push(textures.create(adopted));
        }

        Ok(Self {
            device,
            loader,
            raw,
            graphics_queue: desc.graphics_queue,
            surface_format,
            present_mode,
            textures: texture_handles,
            acquire_semaphores,
            timeline_wait_values: vec![0; num_images as usize],
            current_image_index: 0,
            current_frame: 0,
            needs_acquire: true,
            num_images,
        })
    }

    pub fn num_images(&self) -> u32 {
        self.num_images
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Handle of the image the current frame renders into.
    pub fn current_texture(&self) -> TextureHandle {
        assert!(
            self.current_image_index < self.num_images,
            "swapchain image index out of range"
        );
        self.textures[self.current_image_index as usize]
    }

    /// Acquire the next image if the previous frame was presented.
    ///
    /// Waits the context timeline for the value recorded when the incoming
    /// image slot was last presented, acquires with that slot's semaphore,
    /// and registers the semaphore as the command ring's next wait. Drivers
    /// hand images back round-robin; when one does not, the semaphore is
    /// re-keyed to the slot it actually acquired and that slot's pacing
    /// value is honored as well.
    ///
    /// # Safety
    /// All handles must be valid and `pool` must be the context's ring.
    pub(crate) unsafe fn acquire_if_needed(
        &mut self,
        timeline: vk::Semaphore,
        pool: &mut CommandPool,
    ) -> Result<()> {
        if !self.needs_acquire {
            return Ok(());
        }

        let incoming = self.current_image_index as usize;
        self.wait_timeline(timeline, self.timeline_wait_values[incoming])?;

        let acquire_semaphore = self.acquire_semaphores[incoming];
        match self.loader.acquire_next_image(
            self.raw,
            u64::MAX,
            acquire_semaphore,
            vk::Fence::null(),
        ) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    tracing::debug!("swapchain acquire reported suboptimal");
                }
                self.current_image_index = index;
            }
            // No image was acquired; recreation is the consumer's call.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::warn!("swapchain acquire reported out of date");
            }
            Err(e) => return Err(e.into()),
        }

        let acquired = self.current_image_index as usize;
        if acquired != incoming {
            self.acquire_semaphores.swap(incoming, acquired);
            self.wait_timeline(timeline, self.timeline_wait_values[acquired])?;
        }

        pool.wait_semaphore(acquire_semaphore);
        self.needs_acquire = false;
        Ok(())
    }

    unsafe fn wait_timeline(&self, timeline: vk::Semaphore, value: u64) -> Result<()> {
        let semaphores = [timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        self.device.wait_semaphores(&wait_info, u64::MAX)?;
        Ok(())
    }

    /// Present the current image, waiting on `wait_semaphore` (the binary
    /// semaphore of the submission that rendered into it). Suboptimal and
    /// out-of-date results are observed, not recovered.
    ///
    /// # Safety
    /// The semaphore must be pending a signal from a submitted batch.
    pub(crate) unsafe fn present(&mut self, wait_semaphore: vk::Semaphore) -> Result<()> {
        assert!(
            wait_semaphore != vk::Semaphore::null(),
            "present requires the last submit semaphore"
        );

        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.raw];
        let image_indices = [self.current_image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.loader.queue_present(self.graphics_queue, &present_info) {
            Ok(suboptimal) => {
                if suboptimal {
                    tracing::debug!("swapchain present reported suboptimal");
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::warn!("swapchain present reported out of date");
            }
            Err(e) => return Err(e.into()),
        }

        self.needs_acquire = true;
        self.current_frame += 1;
        Ok(())
    }

    /// Destroy the swapchain and its acquire semaphores. The adopted
    /// textures are destroyed by the context beforehand.
    ///
    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn destroy(&mut self) {
        for &semaphore in &self.acquire_semaphores {
            self.device.destroy_semaphore(semaphore, None);
        }
        self.acquire_semaphores.clear();

        self.loader.destroy_swapchain(self.raw, None);
        self.raw = vk::SwapchainKHR::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn prefers_srgb_nonlinear_pair() {
        let available = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let picked = select_surface_format(&available, ColorSpace::SrgbNonLinear);
        assert_eq!(picked.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(picked.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn linear_request_prefers_bt709_linear() {
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::BT709_LINEAR_EXT),
        ];
        let picked = select_surface_format(&available, ColorSpace::SrgbLinear);
        assert_eq!(picked.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(picked.color_space, vk::ColorSpaceKHR::BT709_LINEAR_EXT);
    }

    #[test]
    fn falls_back_to_format_only_match() {
        let available = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::BT709_LINEAR_EXT),
        ];
        let picked = select_surface_format(&available, ColorSpace::SrgbNonLinear);
        assert_eq!(picked.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(picked.color_space, vk::ColorSpaceKHR::BT709_LINEAR_EXT);
    }

    #[test]
    fn falls_back_to_first_available() {
        let available = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let picked = select_surface_format(&available, ColorSpace::SrgbNonLinear);
        assert_eq!(picked, available[0]);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );

        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&with_mailbox, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn image_count_is_clamped() {
        assert_eq!(clamp_image_count(2), 2);
        assert_eq!(clamp_image_count(MAX_SWAPCHAIN_IMAGES as u32), MAX_SWAPCHAIN_IMAGES as u32);
        assert_eq!(clamp_image_count(64), MAX_SWAPCHAIN_IMAGES as u32);
    }
}
