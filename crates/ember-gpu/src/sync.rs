//! Synchronization primitives and resource state conversions.

use crate::debug::DebugUtils;
use crate::error::Result;
use ash::vk;

/// Create a binary semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(
    device: &ash::Device,
    debug: &DebugUtils,
    name: &str,
) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    debug.set_object_name(semaphore, name);
    Ok(semaphore)
}

/// Create a timeline semaphore starting at `initial_value`.
///
/// # Safety
/// The device must be valid and created with timeline semaphores enabled.
pub unsafe fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
    debug: &DebugUtils,
    name: &str,
) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    let semaphore = device.create_semaphore(&create_info, None)?;
    debug.set_object_name(semaphore, name);
    Ok(semaphore)
}

/// Create an unsignaled fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(
    device: &ash::Device,
    debug: &DebugUtils,
    name: &str,
) -> Result<vk::Fence> {
    let create_info = vk::FenceCreateInfo::default();
    let fence = device.create_fence(&create_info, None)?;
    debug.set_object_name(fence, name);
    Ok(fence)
}

/// The abstract role an image or buffer plays at a barrier boundary.
///
/// Stage, access, layout, and aspect flags are all derived from this, so
/// callers describe transitions in terms of intent rather than raw Vulkan
/// flag soup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Contents undefined. Only valid as a source state.
    Undefined,
    /// Source of a transfer operation.
    TransferSrc,
    /// Destination of a transfer operation.
    TransferDst,
    /// Sampled or uniform-read in a shader.
    ShaderRead,
    /// Read/write storage image in a compute shader.
    Storage,
    /// Color attachment output.
    ColorAttachment,
    /// Depth/stencil attachment.
    DepthStencilAttachment,
    /// Handed to the presentation engine.
    Present,
}

impl ResourceState {
    /// All states, in declaration order.
    pub const ALL: [ResourceState; 8] = [
        ResourceState::Undefined,
        ResourceState::TransferSrc,
        ResourceState::TransferDst,
        ResourceState::ShaderRead,
        ResourceState::Storage,
        ResourceState::ColorAttachment,
        ResourceState::DepthStencilAttachment,
        ResourceState::Present,
    ];

    /// Pipeline stages that touch a resource in this state.
    pub fn stage_flags(self) -> vk::PipelineStageFlags2 {
        match self {
            ResourceState::Undefined => vk::PipelineStageFlags2::NONE,
            ResourceState::TransferSrc | ResourceState::TransferDst => {
                vk::PipelineStageFlags2::TRANSFER
            }
            ResourceState::ShaderRead => {
                vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER
            }
            ResourceState::Storage => vk::PipelineStageFlags2::COMPUTE_SHADER,
            ResourceState::ColorAttachment => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ResourceState::DepthStencilAttachment => {
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            }
            ResourceState::Present => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        }
    }

    /// Memory accesses performed on a resource in this state.
    pub fn access_flags(self) -> vk::AccessFlags2 {
        match self {
            ResourceState::Undefined => vk::AccessFlags2::NONE,
            ResourceState::TransferSrc => vk::AccessFlags2::TRANSFER_READ,
            ResourceState::TransferDst => vk::AccessFlags2::TRANSFER_WRITE,
            ResourceState::ShaderRead => vk::AccessFlags2::SHADER_READ,
            ResourceState::Storage => {
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
            }
            ResourceState::ColorAttachment => {
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            }
            ResourceState::DepthStencilAttachment => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ResourceState::Present => vk::AccessFlags2::NONE,
        }
    }

    /// Image layout an image holds in this state.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::Storage => vk::ImageLayout::GENERAL,
            ResourceState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ResourceState::DepthStencilAttachment => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Base aspect for images in this state. Stencil is added from the image
    /// format, never from the state.
    pub fn aspect_flags(self) -> vk::ImageAspectFlags {
        match self {
            ResourceState::DepthStencilAttachment => vk::ImageAspectFlags::DEPTH,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_is_a_pure_source_state() {
        assert_eq!(
            ResourceState::Undefined.stage_flags(),
            vk::PipelineStageFlags2::NONE
        );
        assert_eq!(ResourceState::Undefined.access_flags(), vk::AccessFlags2::NONE);
        assert_eq!(ResourceState::Undefined.layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn conversions_are_total() {
        for state in ResourceState::ALL {
            // Every state must produce a usable layout and aspect.
            assert_ne!(state.aspect_flags(), vk::ImageAspectFlags::empty());
            if state != ResourceState::Undefined {
                assert_ne!(state.layout(), vk::ImageLayout::UNDEFINED);
                assert_ne!(state.stage_flags(), vk::PipelineStageFlags2::NONE);
            }
        }
    }

    #[test]
    fn depth_attachment_uses_depth_aspect() {
        assert_eq!(
            ResourceState::DepthStencilAttachment.aspect_flags(),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            ResourceState::ColorAttachment.aspect_flags(),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn present_keeps_presentable_layout() {
        assert_eq!(ResourceState::Present.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(ResourceState::Present.access_flags(), vk::AccessFlags2::NONE);
    }
}
