//! GPU context: device bring-up and per-frame submission.
//!
//! The context is single-threaded with respect to recording: at most one
//! command buffer is live at a time, and submit/present happen on the thread
//! that recorded. The GPU is the other execution engine; every ordering
//! guarantee here is expressed through semaphores and fences.

use crate::barrier::{self, GlobalBarrier, ImageBarrier};
use crate::command::{CommandPool, SubmitHandle};
use crate::debug::DebugUtils;
use crate::deferred::DeferredQueue;
use crate::error::{GpuError, Result};
use crate::image::{Image, TextureAllocator, UnmanagedAllocator};
use crate::instance::{create_device, create_instance, select_physical_device, DeviceQueues, HardwareType};
use crate::pool::{Pool, ShaderModuleHandle, ShaderModuleTag, TextureHandle, TextureTag};
use crate::surface::SurfaceContext;
use crate::swapchain::{ColorSpace, Swapchain, SwapchainDescription};
use crate::sync;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// Pool of all images owned or adopted by a context.
pub type TexturePool = Pool<Image, TextureTag>;

/// Pool of shader modules owned by a context.
pub type ShaderModulePool = Pool<ShaderModuleState, ShaderModuleTag>;

/// A compiled shader module and the push-constant budget its pipelines use.
pub struct ShaderModuleState {
    pub raw: vk::ShaderModule,
    pub push_constant_size: u32,
}

/// Pre-compiled SPIR-V plus metadata, as delivered by the shader toolchain.
pub struct ShaderModuleDescription<'a> {
    pub spirv: &'a [u32],
    pub debug_name: &'a str,
    pub push_constant_size: u32,
}

struct ContextState {
    swapchain: Option<Swapchain>,
    pool: CommandPool,
    textures: TexturePool,
    shader_modules: ShaderModulePool,
    deferred: DeferredQueue,
    command_buffer_live: bool,
}

/// Top-level GPU context.
///
/// Owns the instance, device, surface, swapchain, timeline semaphore, and
/// command ring. All mutation goes through an internal lock so handle
/// holders can destroy through a shared reference.
pub struct Context {
    // Entry must outlive everything loaded from it.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug: DebugUtils,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    queues: DeviceQueues,
    surface: SurfaceContext,
    /// Signaled by presenting submissions; paces the CPU per swapchain image.
    timeline_semaphore: vk::Semaphore,
    allocator: Arc<dyn TextureAllocator>,
    state: Mutex<ContextState>,
}

impl Context {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.queues.graphics
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.queues.graphics_family
    }

    /// The context-wide timeline semaphore. Advanced consumers may wait on
    /// it directly; they must not signal it.
    pub fn timeline_semaphore(&self) -> vk::Semaphore {
        self.timeline_semaphore
    }

    /// Number of swapchain images.
    pub fn swapchain_num_images(&self) -> u32 {
        self.state
            .lock()
            .swapchain
            .as_ref()
            .map_or(0, Swapchain::num_images)
    }

    /// Begin recording a command buffer.
    ///
    /// At most one command buffer may be live per context; acquiring a
    /// second one is a contract violation.
    pub fn acquire_command_buffer(&self) -> Result<CommandBuffer<'_>> {
        let mut state = self.state.lock();
        assert!(
            !state.command_buffer_live,
            "another command buffer has already been acquired this frame"
        );

        let (slot, raw) = unsafe { state.pool.acquire()? };
        state.command_buffer_live = true;

        Ok(CommandBuffer {
            ctx: self,
            raw,
            slot,
        })
    }

    /// Submit a recorded command buffer, optionally presenting a swapchain
    /// texture the buffer transitioned to the present state.
    ///
    /// When presenting, the submission also signals the timeline semaphore
    /// at `current_frame + num_images`; that value is recorded against the
    /// presented image and gates its re-acquisition.
    pub fn submit(
        &self,
        command_buffer: CommandBuffer<'_>,
        present: Option<TextureHandle>,
    ) -> Result<SubmitHandle> {
        let mut state = self.state.lock();
        let ContextState {
            swapchain,
            pool,
            textures,
            deferred,
            command_buffer_live,
            ..
        } = &mut *state;

        if let Some(texture) = present {
            let image = textures
                .get(texture)
                .expect("present texture has been destroyed");
            assert!(
                image.is_swapchain_image(),
                "present texture is not a swapchain image"
            );
        }

        let mut presenting = if present.is_some() {
            swapchain.as_mut()
        } else {
            None
        };

        if let Some(swapchain) = presenting.as_deref_mut() {
            let signal_value = swapchain.current_frame() + u64::from(swapchain.num_images());
            // Wait for this value next time this image slot comes around.
            swapchain.timeline_wait_values[swapchain.current_image_index as usize] = signal_value;
            pool.signal(self.timeline_semaphore, signal_value);
        }

        let handle = unsafe { pool.submit(command_buffer.slot)? };

        if let Some(swapchain) = presenting {
            let render_done = pool.acquire_last_submit_semaphore();
            unsafe { swapchain.present(render_done)? };
        }

        let pool_ref: &CommandPool = pool;
        deferred.process(|handle| pool_ref.is_ready(handle, true));

        *command_buffer_live = false;
        Ok(handle)
    }

    /// Handle of the swapchain image the current frame renders into.
    ///
    /// The first call after a present blocks until the GPU has finished with
    /// the incoming image (bounded at `num_images - 1` frames of lag), then
    /// acquires it.
    pub fn get_swapchain_texture(&self) -> Result<TextureHandle> {
        let mut state = self.state.lock();
        let ContextState {
            swapchain, pool, ..
        } = &mut *state;

        let swapchain = swapchain.as_mut().expect("context has no swapchain");
        unsafe { swapchain.acquire_if_needed(self.timeline_semaphore, pool)? };

        let texture = swapchain.current_texture();
        assert!(!texture.is_empty(), "swapchain texture is not valid");
        Ok(texture)
    }

    /// Create a shader module from pre-compiled SPIR-V.
    pub fn create_shader_module(
        &self,
        desc: &ShaderModuleDescription,
    ) -> Result<Holder<'_, ShaderModuleHandle>> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(desc.spirv);
        let raw = unsafe { self.device.create_shader_module(&create_info, None)? };
        self.debug.set_object_name(raw, desc.debug_name);

        let handle = self.state.lock().shader_modules.create(ShaderModuleState {
            raw,
            push_constant_size: desc.push_constant_size,
        });

        Ok(Holder {
            ctx: self,
            handle,
        })
    }

    /// Destroy a texture.
    ///
    /// The handle is invalidated immediately; the views (and, for owned
    /// images, the device image) die once every submission that could touch
    /// them has retired. Stale handles are a no-op.
    pub fn destroy_texture(&self, handle: TextureHandle) {
        let mut state = self.state.lock();
        destroy_texture_locked(&self.device, &self.allocator, &mut state, handle);
    }

    /// Destroy a shader module.
    ///
    /// Shader modules are destroyed eagerly: the driver keeps pipelines
    /// valid after their modules are gone. Stale handles are a no-op.
    pub fn destroy_shader_module(&self, handle: ShaderModuleHandle) {
        let Some(module) = self.state.lock().shader_modules.destroy(handle) else {
            return;
        };
        unsafe { self.device.destroy_shader_module(module.raw, None) };
    }

    /// Run `task` once the submission behind `handle` has retired.
    ///
    /// The empty handle means "after the submission currently being recorded
    /// (or the next one to be recorded) completes".
    pub fn defer(&self, handle: SubmitHandle, task: impl FnOnce() + 'static) {
        let mut state = self.state.lock();
        let handle = if handle.is_empty() {
            state.pool.next_submit_handle()
        } else {
            handle
        };
        state.deferred.defer(Box::new(task), handle);
    }

    /// Block until the submission behind `handle` has retired. The empty
    /// handle waits for the whole device.
    pub fn wait(&self, handle: SubmitHandle) -> Result<()> {
        unsafe { self.state.lock().pool.wait(handle) }
    }

    /// Whether the submission behind `handle` has retired.
    pub fn is_ready(&self, handle: SubmitHandle) -> bool {
        self.state.lock().pool.is_ready(handle, false)
    }
}

fn destroy_texture_locked(
    device: &Arc<ash::Device>,
    allocator: &Arc<dyn TextureAllocator>,
    state: &mut ContextState,
    handle: TextureHandle,
) {
    let Some(image) = state.textures.destroy(handle) else {
        return;
    };

    let after = state.pool.next_submit_handle();

    for view in image.all_views() {
        let device = Arc::clone(device);
        state.deferred.defer(
            Box::new(move || unsafe { device.destroy_image_view(view, None) }),
            after,
        );
    }

    if image.owns_image {
        let device = Arc::clone(device);
        let allocator = Arc::clone(allocator);
        let raw = image.raw;
        state.deferred.defer(
            Box::new(move || unsafe { allocator.destroy_image(&device, raw) }),
            after,
        );
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("device_wait_idle failed on context teardown: {e}");
            }

            let state = self.state.get_mut();

            // Swapchain textures go through the regular deferred path; the
            // swapchain itself follows once they are queued.
            if let Some(mut swapchain) = state.swapchain.take() {
                let handles: Vec<TextureHandle> = swapchain.textures.drain(..).collect();
                for handle in handles {
                    destroy_texture_locked(&self.device, &self.allocator, state, handle);
                }
                swapchain.destroy();
            }

            self.device.destroy_semaphore(self.timeline_semaphore, None);

            let leaked_textures = state.textures.num_objects();
            if leaked_textures > 0 {
                tracing::error!("{leaked_textures} leaked textures");
            }
            state.textures.clear();

            let leaked_modules = state.shader_modules.num_objects();
            if leaked_modules > 0 {
                tracing::error!("{leaked_modules} leaked shader modules");
            }
            state.shader_modules.clear();

            let ContextState {
                pool, deferred, ..
            } = state;
            deferred.drain(|handle| {
                if let Err(e) = pool.wait(handle) {
                    tracing::error!("failed to wait for deferred task submission: {e}");
                }
            });

            pool.destroy();
            self.surface.destroy();
            self.device.destroy_device(None);
            self.debug.destroy();
            self.instance.destroy_instance(None);
        }
    }
}

/// A command buffer being recorded.
///
/// Obtained from [`Context::acquire_command_buffer`] and consumed by
/// [`Context::submit`].
pub struct CommandBuffer<'a> {
    ctx: &'a Context,
    raw: vk::CommandBuffer,
    slot: usize,
}

impl CommandBuffer<'_> {
    /// Raw handle for recording through `ash`.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Record all given barriers as a single dependency.
    pub fn cmd_pipeline_barrier(&self, global_barriers: &[GlobalBarrier], image_barriers: &[ImageBarrier]) {
        let state = self.ctx.state.lock();
        unsafe {
            barrier::record(
                &self.ctx.device,
                self.raw,
                &state.textures,
                global_barriers,
                image_barriers,
            );
        }
    }
}

/// Handle types the context can destroy on behalf of a [`Holder`].
pub trait ContextOwned: Copy {
    fn destroy(self, ctx: &Context);
}

impl ContextOwned for TextureHandle {
    fn destroy(self, ctx: &Context) {
        ctx.destroy_texture(self);
    }
}

impl ContextOwned for ShaderModuleHandle {
    fn destroy(self, ctx: &Context) {
        ctx.destroy_shader_module(self);
    }
}

/// Owning handle wrapper: destroys through its context on scope exit.
pub struct Holder<'a, H: ContextOwned> {
    ctx: &'a Context,
    handle: H,
}

impl<H: ContextOwned> Holder<'_, H> {
    /// The wrapped handle. Copies stop resolving once the holder drops.
    pub fn handle(&self) -> H {
        self.handle
    }
}

impl<H: ContextOwned> Drop for Holder<'_, H> {
    fn drop(&mut self) {
        self.handle.destroy(self.ctx);
    }
}

/// Builder for creating a [`Context`] with a swapchain.
pub struct ContextBuilder {
    app_name: String,
    enable_validation: bool,
    color_space: ColorSpace,
    preferred_hardware: HardwareType,
    allocator: Arc<dyn TextureAllocator>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Ember".to_string(),
            enable_validation: cfg!(debug_assertions),
            color_space: ColorSpace::default(),
            preferred_hardware: HardwareType::default(),
            allocator: Arc::new(UnmanagedAllocator),
        }
    }
}

impl ContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers. Requested, not demanded: when
    /// the layer is absent the context comes up without it.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Desired swapchain color space.
    pub fn color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = color_space;
        self
    }

    /// Preferred hardware type for device selection.
    pub fn preferred_hardware(mut self, hardware: HardwareType) -> Self {
        self.preferred_hardware = hardware;
        self
    }

    /// Plug in the allocator collaborator for memory-backed images.
    pub fn allocator(mut self, allocator: Arc<dyn TextureAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Bring up the device and build the context with a swapchain for
    /// `window` at the given size.
    pub fn build<W>(self, window: &W, width: u32, height: u32) -> Result<Context>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let mut enable_validation = self.enable_validation;
        let instance = unsafe { create_instance(&entry, &self.app_name, &mut enable_validation)? };
        let mut debug = unsafe { DebugUtils::new(&entry, &instance, enable_validation)? };

        let surface = unsafe { SurfaceContext::new(&entry, &instance, window)? };

        let (physical_device, capabilities) =
            unsafe { select_physical_device(&instance, self.preferred_hardware)? };
        tracing::info!("selected GPU: {}", capabilities.summary());

        let (device, queues) = unsafe { create_device(&instance, physical_device)? };
        let device = Arc::new(device);
        debug.attach_device(&instance, &device);

        let mut textures = TexturePool::new();
        let swapchain = unsafe {
            Swapchain::new(
                &instance,
                Arc::clone(&device),
                &debug,
                &mut textures,
                &SwapchainDescription {
                    surface: surface.surface,
                    surface_loader: &surface.loader,
                    physical_device,
                    graphics_family: queues.graphics_family,
                    graphics_queue: queues.graphics,
                    width,
                    height,
                    color_space: self.color_space,
                },
            )?
        };

        // Pre-signaled so the first num_images - 1 acquires never wait.
        let timeline_semaphore = unsafe {
            sync::create_timeline_semaphore(
                &device,
                u64::from(swapchain.num_images()) - 1,
                &debug,
                "frame timeline semaphore",
            )?
        };

        let pool = unsafe { CommandPool::new(Arc::clone(&device), &debug, queues.graphics_family)? };

        Ok(Context {
            entry,
            instance,
            debug,
            physical_device,
            device,
            queues,
            surface,
            timeline_semaphore,
            allocator: self.allocator,
            state: Mutex::new(ContextState {
                swapchain: Some(swapchain),
                pool,
                textures,
                shader_modules: ShaderModulePool::new(),
                deferred: DeferredQueue::new(),
                command_buffer_live: false,
            }),
        })
    }
}
