//! Pipeline barrier helper: abstract resource-state transitions collapsed
//! into a single synchronization2 dependency.

use crate::image::Image;
use crate::pool::{Pool, TextureHandle, TextureTag};
use crate::sync::ResourceState;
use ash::vk;

/// A memory barrier between two resource states.
#[derive(Debug, Clone, Copy)]
pub struct GlobalBarrier {
    pub current: ResourceState,
    pub next: ResourceState,
}

/// A layout transition of one image between two resource states.
///
/// The transition always covers all remaining mips and layers.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub texture: TextureHandle,
    pub current: ResourceState,
    pub next: ResourceState,
}

fn memory_barrier(barrier: &GlobalBarrier) -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(barrier.current.stage_flags())
        .src_access_mask(barrier.current.access_flags())
        .dst_stage_mask(barrier.next.stage_flags())
        .dst_access_mask(barrier.next.access_flags())
}

fn image_memory_barrier(image: &Image, barrier: &ImageBarrier) -> vk::ImageMemoryBarrier2<'static> {
    // Color or depth comes from the source state; stencil from the format.
    let aspect_mask = image.barrier_aspect(barrier.current.aspect_flags());

    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(barrier.current.stage_flags())
        .src_access_mask(barrier.current.access_flags())
        .dst_stage_mask(barrier.next.stage_flags())
        .dst_access_mask(barrier.next.access_flags())
        .old_layout(barrier.current.layout())
        .new_layout(barrier.next.layout())
        .image(image.raw)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS),
        )
}

/// Record all barriers as one dependency.
///
/// # Safety
/// The command buffer must be recording and every referenced texture must be
/// live in the pool.
pub(crate) unsafe fn record(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    textures: &Pool<Image, TextureTag>,
    global_barriers: &[GlobalBarrier],
    image_barriers: &[ImageBarrier],
) {
    let memory_barriers: Vec<vk::MemoryBarrier2> =
        global_barriers.iter().map(memory_barrier).collect();

    let image_memory_barriers: Vec<vk::ImageMemoryBarrier2> = image_barriers
        .iter()
        .map(|barrier| {
            let image = textures
                .get(barrier.texture)
                .expect("image barrier references a destroyed texture");
            image_memory_barrier(image, barrier)
        })
        .collect();

    let dependency_info = vk::DependencyInfo::default()
        .memory_barriers(&memory_barriers)
        .image_memory_barriers(&image_memory_barriers);

    device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageType;
    use hashbrown::HashMap;

    fn test_image(format: vk::Format) -> Image {
        Image {
            raw: vk::Image::null(),
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            image_type: ImageType::Image2D,
            format,
            levels: 1,
            layers: 1,
            view: vk::ImageView::null(),
            storage_view: None,
            framebuffer_views: HashMap::new(),
            owns_image: true,
        }
    }

    #[test]
    fn global_barrier_uses_both_state_tables() {
        let barrier = memory_barrier(&GlobalBarrier {
            current: ResourceState::TransferDst,
            next: ResourceState::ShaderRead,
        });
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::SHADER_READ);
    }

    #[test]
    fn image_barrier_transitions_layout() {
        let image = test_image(vk::Format::R8G8B8A8_SRGB);
        let barrier = image_memory_barrier(
            &image,
            &ImageBarrier {
                texture: TextureHandle::empty(),
                current: ResourceState::Undefined,
                next: ResourceState::Present,
            },
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(barrier.subresource_range.layer_count, vk::REMAINING_ARRAY_LAYERS);
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn stencil_aspect_comes_from_the_format() {
        let image = test_image(vk::Format::D24_UNORM_S8_UINT);
        let barrier = image_memory_barrier(
            &image,
            &ImageBarrier {
                texture: TextureHandle::empty(),
                current: ResourceState::DepthStencilAttachment,
                next: ResourceState::ShaderRead,
            },
        );
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );

        let depth_only = test_image(vk::Format::D32_SFLOAT);
        let barrier = image_memory_barrier(
            &depth_only,
            &ImageBarrier {
                texture: TextureHandle::empty(),
                current: ResourceState::DepthStencilAttachment,
                next: ResourceState::ShaderRead,
            },
        );
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }
}
