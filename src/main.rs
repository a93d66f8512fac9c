// =============================================================================
// SPACE RENDERER - Minimal Vulkan front-end
// =============================================================================
//
// Opens a window, negotiates a swapchain and draws one triangle through a
// fixed pipeline, with two frames in flight.
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image
// 3. Wait for whichever frame last rendered into that image
// 4. Submit pre-recorded commands to GPU
// 5. Present rendered image to screen
//
// =============================================================================

mod backend;
mod config;
mod error;
mod renderer;

use anyhow::{Context, Result};
use ash::vk;
use backend::ShaderSet;
use config::{Config, DEFAULT_CONFIG_PATH};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use renderer::Renderer;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    // Load configuration (path may be given as the first argument)
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path);

    log::info!("Starting Vulkan renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    // Shader blobs must be usable before any Vulkan object is created
    let shaders = ShaderSet::load(&config.shaders).context("Failed to load shaders")?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, shaders);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, `RUST_LOG` overrides the default level
fn init_logging() {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Owns the window and the renderer.
///
/// IMPORTANT: `renderer` is declared before `window` so it is dropped first;
/// the surface must go before the window it was created from.
pub struct App {
    config: Config,
    /// Taken when the renderer is built
    shaders: Option<ShaderSet>,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    /// Set while the window has no drawable area; redraws resume on resize
    idle: bool,
    /// First fatal error, reported when the event loop returns
    fatal: Option<anyhow::Error>,
}

impl App {
    pub fn new(config: Config, shaders: ShaderSet) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            shaders: Some(shaders),
            renderer: None,
            window: None,
            is_fullscreen,
            idle: false,
            fatal: None,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let shaders = self.shaders.take().context("Renderer already initialized")?;
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        let renderer = Renderer::new(
            &self.config,
            shaders,
            window.raw_display_handle(),
            window.raw_window_handle(),
            extent,
        )?;

        self.renderer = Some(renderer);
        Ok(())
    }

    /// Stop the loop, keeping the error for `main` to return
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        // Tear down while the window still exists
        self.renderer = None;
        self.fatal.get_or_insert(error);
        event_loop.exit();
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        log::info!("Started creating window");

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
            return;
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                // Dropping the renderer waits for the GPU before destroying anything
                self.renderer = None;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
                if self.idle {
                    log::debug!("Resize received, resuming redraws");
                    self.idle = false;
                    if let Some(ref window) = self.window {
                        window.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                match renderer.draw_frame() {
                    Ok(drawable) => self.idle = !drawable,
                    Err(e) => {
                        self.fail(event_loop, anyhow::Error::new(e).context("Frame submission failed"));
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.renderer = None;
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws between event batches, unless minimized.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.idle {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
