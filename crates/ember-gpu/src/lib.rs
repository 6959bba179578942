//! Vulkan abstraction layer for the Ember engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - A swapchain with per-image frame pacing over a timeline semaphore
//! - A fixed ring of command buffers with per-buffer fences and semaphores
//! - Generational handle pools for textures and shader modules
//! - Deferred destruction gated on submission completion
//!
//! The CPU side is single-threaded: one command buffer is recorded at a
//! time, and submit/present run on the recording thread. Pacing against the
//! GPU is done entirely with Vulkan 1.3 synchronization (timeline
//! semaphores, synchronization2).

pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod debug;
pub mod deferred;
pub mod error;
pub mod image;
pub mod instance;
pub mod pool;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use barrier::{GlobalBarrier, ImageBarrier};
pub use capabilities::{DeviceCapabilities, GpuVendor};
pub use command::{SubmitHandle, MAX_COMMAND_BUFFERS};
pub use context::{
    CommandBuffer, Context, ContextBuilder, Holder, ShaderModuleDescription, ShaderModulePool,
    TexturePool,
};
pub use error::{GpuError, Result};
pub use image::{Image, ImageType, TextureAllocator};
pub use instance::HardwareType;
pub use pool::{Handle, Pool, ShaderModuleHandle, TextureHandle};
pub use swapchain::{ColorSpace, Swapchain, MAX_SWAPCHAIN_IMAGES};
pub use sync::ResourceState;
