//! Minimal Ember viewer: brings up a GPU context and presents empty frames.
//!
//! Each frame acquires a command buffer, transitions the swapchain image to
//! the present state, and submits with that image as the present target.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::Context as _;
use ember_gpu::{
    Context, ContextBuilder, HardwareType, ImageBarrier, ResourceState,
};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowId};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

#[derive(Default)]
struct Viewer {
    // Declared before the window so the surface dies first.
    ctx: Option<Context>,
    window: Option<Window>,
}

impl Viewer {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let ctx = self.ctx.as_ref().context("GPU context not initialized")?;

        let cmd = ctx.acquire_command_buffer()?;
        let backbuffer = ctx.get_swapchain_texture()?;

        cmd.cmd_pipeline_barrier(
            &[],
            &[ImageBarrier {
                texture: backbuffer,
                current: ResourceState::Undefined,
                next: ResourceState::Present,
            }],
        );

        ctx.submit(cmd, Some(backbuffer))?;
        Ok(())
    }
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title("Ember Viewer")
            .with_inner_size(LogicalSize::new(WIDTH, HEIGHT));

        let window = match event_loop.create_window(attributes) {
            Ok(window) => window,
            Err(e) => {
                tracing::error!("failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };

        let size = window.inner_size();
        let ctx = ContextBuilder::new()
            .app_name("Ember Viewer")
            .validation(true)
            .preferred_hardware(HardwareType::Discrete)
            .build(&window, size.width, size.height);

        match ctx {
            Ok(ctx) => {
                self.ctx = Some(ctx);
                self.window = Some(window);
            }
            Err(e) => {
                tracing::error!("failed to create GPU context: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    tracing::error!("frame failed: {e}");
                    event_loop.exit();
                    return;
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let event_loop = EventLoop::new()?;
    let mut viewer = Viewer::default();
    event_loop.run_app(&mut viewer)?;
    Ok(())
}
