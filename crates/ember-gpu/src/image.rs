//! Image wrapper: a device image plus its views.

use crate::debug::DebugUtils;
use crate::error::{GpuError, Result};
use ash::vk;
use hashbrown::HashMap;

/// Logical image dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Image1D,
    Image1DArray,
    Image2D,
    Image2DArray,
    Image3D,
    Cube,
    CubeArray,
    /// An image adopted from the swapchain. Viewed as 2D.
    SwapChain,
}

impl ImageType {
    pub fn to_image_type(self) -> vk::ImageType {
        match self {
            ImageType::Image1D | ImageType::Image1DArray => vk::ImageType::TYPE_1D,
            ImageType::Image2D
            | ImageType::Image2DArray
            | ImageType::Cube
            | ImageType::CubeArray
            | ImageType::SwapChain => vk::ImageType::TYPE_2D,
            ImageType::Image3D => vk::ImageType::TYPE_3D,
        }
    }

    pub fn to_view_type(self) -> vk::ImageViewType {
        match self {
            ImageType::Image1D => vk::ImageViewType::TYPE_1D,
            ImageType::Image1DArray => vk::ImageViewType::TYPE_1D_ARRAY,
            ImageType::Image2D | ImageType::SwapChain => vk::ImageViewType::TYPE_2D,
            ImageType::Image2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
            ImageType::Cube => vk::ImageViewType::CUBE,
            ImageType::CubeArray => vk::ImageViewType::CUBE_ARRAY,
            ImageType::Image3D => vk::ImageViewType::TYPE_3D,
        }
    }
}

/// Whether a format carries a depth plane.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether a format carries both depth and stencil planes.
pub fn is_depth_stencil_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Everything needed to adopt an existing device image.
pub struct ImageDescription<'a> {
    pub raw: vk::Image,
    pub usage: vk::ImageUsageFlags,
    pub extent: vk::Extent3D,
    pub image_type: ImageType,
    pub format: vk::Format,
    pub levels: u32,
    pub layers: u32,
    pub debug_name: &'a str,
}

/// A device image together with its main view, optional storage view, and
/// lazily-populated per-(mip, layer) framebuffer views.
pub struct Image {
    pub raw: vk::Image,
    pub usage: vk::ImageUsageFlags,
    pub extent: vk::Extent3D,
    pub image_type: ImageType,
    pub format: vk::Format,
    pub levels: u32,
    pub layers: u32,
    pub view: vk::ImageView,
    pub storage_view: Option<vk::ImageView>,
    pub framebuffer_views: HashMap<(u32, u32), vk::ImageView>,
    /// False for adopted images (swapchain). Their destruction frees views
    /// but never the device image itself.
    pub owns_image: bool,
}

impl Image {
    /// Adopt an existing device image: create the main view, set debug
    /// names. No memory is allocated.
    ///
    /// # Safety
    /// The device and the image must be valid, and the description must
    /// match how the image was created.
    pub unsafe fn adopt(
        device: &ash::Device,
        debug: &DebugUtils,
        desc: &ImageDescription,
    ) -> Result<Self> {
        debug.set_object_name(desc.raw, desc.debug_name);

        let view = create_image_view(
            device,
            debug,
            desc.raw,
            desc.image_type,
            desc.format,
            desc.levels,
            desc.layers,
            desc.debug_name,
        )?;

        Ok(Self {
            raw: desc.raw,
            usage: desc.usage,
            extent: desc.extent,
            image_type: desc.image_type,
            format: desc.format,
            levels: desc.levels,
            layers: desc.layers,
            view,
            storage_view: None,
            framebuffer_views: HashMap::new(),
            owns_image: false,
        })
    }

    pub fn is_swapchain_image(&self) -> bool {
        self.image_type == ImageType::SwapChain
    }

    pub fn is_depth_attachment(&self) -> bool {
        is_depth_format(self.format)
    }

    /// Aspect mask for barriers on this image: the state's base aspect plus
    /// stencil when the format carries it.
    pub fn barrier_aspect(&self, base: vk::ImageAspectFlags) -> vk::ImageAspectFlags {
        if is_depth_stencil_format(self.format) {
            base | vk::ImageAspectFlags::STENCIL
        } else {
            base
        }
    }

    /// Every live view of this image, main view first.
    pub fn all_views(&self) -> Vec<vk::ImageView> {
        let mut views = Vec::with_capacity(2 + self.framebuffer_views.len());
        views.push(self.view);
        if let Some(storage) = self.storage_view {
            views.push(storage);
        }
        views.extend(self.framebuffer_views.values().copied());
        views
    }
}

/// Create an image view matching the image's type, format, and ranges.
///
/// # Safety
/// The device and image must be valid.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn create_image_view(
    device: &ash::Device,
    debug: &DebugUtils,
    image: vk::Image,
    image_type: ImageType,
    format: vk::Format,
    levels: u32,
    layers: u32,
    debug_name: &str,
) -> Result<vk::ImageView> {
    let aspect = if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(image_type.to_view_type())
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(levels)
                .base_array_layer(0)
                .layer_count(layers),
        );

    let view = device.create_image_view(&create_info, None)?;
    debug.set_object_name(view, debug_name);
    Ok(view)
}

/// Hooks for the external allocator collaborator.
///
/// The context routes creation and destruction of memory-backed images
/// through this trait; the core itself only adopts swapchain images and
/// ships the placeholder below.
pub trait TextureAllocator {
    /// Create and bind a device image.
    ///
    /// # Safety
    /// The device and create info must be valid.
    unsafe fn create_image(
        &self,
        device: &ash::Device,
        info: &vk::ImageCreateInfo,
    ) -> Result<vk::Image>;

    /// Destroy a device image previously created through this allocator.
    ///
    /// # Safety
    /// The image must not be in use by the GPU.
    unsafe fn destroy_image(&self, device: &ash::Device, image: vk::Image);

    /// Map the image's backing memory.
    ///
    /// # Safety
    /// The image must have host-visible backing memory.
    unsafe fn map(&self, device: &ash::Device, image: vk::Image) -> Result<*mut u8>;

    /// Unmap the image's backing memory.
    ///
    /// # Safety
    /// The image must currently be mapped.
    unsafe fn unmap(&self, device: &ash::Device, image: vk::Image);
}

/// Placeholder allocator: cannot create images, destroys raw handles only.
pub struct UnmanagedAllocator;

impl TextureAllocator for UnmanagedAllocator {
    unsafe fn create_image(
        &self,
        _device: &ash::Device,
        _info: &vk::ImageCreateInfo,
    ) -> Result<vk::Image> {
        Err(GpuError::NoAllocator("image creation".into()))
    }

    unsafe fn destroy_image(&self, device: &ash::Device, image: vk::Image) {
        device.destroy_image(image, None);
    }

    unsafe fn map(&self, _device: &ash::Device, _image: vk::Image) -> Result<*mut u8> {
        Err(GpuError::NoAllocator("image mapping".into()))
    }

    unsafe fn unmap(&self, _device: &ash::Device, _image: vk::Image) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_images_view_as_2d() {
        assert_eq!(ImageType::SwapChain.to_view_type(), vk::ImageViewType::TYPE_2D);
        assert_eq!(ImageType::SwapChain.to_image_type(), vk::ImageType::TYPE_2D);
    }

    #[test]
    fn cube_maps_are_2d_images() {
        assert_eq!(ImageType::Cube.to_image_type(), vk::ImageType::TYPE_2D);
        assert_eq!(ImageType::Cube.to_view_type(), vk::ImageViewType::CUBE);
        assert_eq!(ImageType::CubeArray.to_view_type(), vk::ImageViewType::CUBE_ARRAY);
    }

    #[test]
    fn depth_format_predicates() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(!is_depth_stencil_format(vk::Format::D32_SFLOAT));
        assert!(is_depth_stencil_format(vk::Format::D24_UNORM_S8_UINT));
        assert!(is_depth_format(vk::Format::D24_UNORM_S8_UINT));
        assert!(!is_depth_format(vk::Format::R8G8B8A8_SRGB));
    }
}
