// =============================================================================
// RENDERER - Ownership tree of every Vulkan object
// =============================================================================
//
// Build order (each stage borrows the ones above it):
//
//   InstanceContext (instance, messenger, surface)
//     └── VulkanDevice (logical device, queues)
//           └── Presentation (swapchain + views, pipeline, framebuffers, commands)
//                 └── FrameScheduler (semaphores, fences)
//
// Teardown runs the same list bottom-up in `Drop`, after the device is idle.
// =============================================================================

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::commands::FrameCommands;
use crate::backend::frame::DeviceFrameDriver;
use crate::backend::pipeline::PipelineAssets;
use crate::backend::probe::{self, SurfaceSupport};
use crate::backend::selector::{self, REQUIRED_DEVICE_EXTENSIONS};
use crate::backend::swapchain::SwapchainDescriptor;
use crate::backend::{
    FrameScheduler, InstanceContext, ShaderSet, Swapchain, VulkanDevice, MAX_FRAMES_IN_FLIGHT,
};
use crate::config::Config;
use crate::error::{RendererError, RendererResult};

/// Everything that depends on the swapchain extent; rebuilt as a unit
struct Presentation {
    swapchain: Swapchain,
    assets: PipelineAssets,
    commands: FrameCommands,
}

impl Presentation {
    fn build(
        instance: &InstanceContext,
        device: &VulkanDevice,
        support: &SurfaceSupport,
        desired_extent: vk::Extent2D,
        shaders: &ShaderSet,
        clear_color: [f32; 4],
    ) -> RendererResult<Self> {
        let descriptor = SwapchainDescriptor::negotiate(support, &device.queue_families, desired_extent)?;
        let mut swapchain = Swapchain::new(&instance.instance, device, instance.surface, &descriptor)?;

        let mut assets = match PipelineAssets::new(&device.device, &swapchain, shaders) {
            Ok(assets) => assets,
            Err(e) => {
                unsafe { swapchain.destroy(&device.device) };
                return Err(e);
            }
        };

        let commands = FrameCommands::new(&device.device, device.queue_families.graphics)
            .and_then(|mut commands| match commands.record(&device.device, &assets, clear_color) {
                Ok(()) => Ok(commands),
                Err(e) => {
                    unsafe { commands.destroy(&device.device) };
                    Err(e)
                }
            });

        match commands {
            Ok(commands) => Ok(Self {
                swapchain,
                assets,
                commands,
            }),
            Err(e) => {
                unsafe {
                    assets.destroy(&device.device);
                    swapchain.destroy(&device.device);
                }
                Err(e)
            }
        }
    }

    fn image_count(&self) -> usize {
        self.swapchain.images.len()
    }

    /// Safe to call twice: every destroy nulls what it released
    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.commands.destroy(device);
        self.assets.destroy(device);
        self.swapchain.destroy(device);
    }
}

pub struct Renderer {
    instance: InstanceContext,
    device: VulkanDevice,
    presentation: Presentation,
    scheduler: FrameScheduler,

    shaders: ShaderSet,
    clear_color: [f32; 4],
    desired_extent: vk::Extent2D,
    needs_rebuild: bool,
}

impl Renderer {
    /// Build every stage for the given window.
    ///
    /// Shader blobs are validated by the caller before any Vulkan object exists.
    pub fn new(
        config: &Config,
        shaders: ShaderSet,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        window_extent: vk::Extent2D,
    ) -> RendererResult<Self> {
        log::info!("Started initialising Vulkan");

        let mut instance = InstanceContext::new(
            &config.window.title,
            display_handle,
            window_handle,
            config.validation_enabled(),
        )?;

        let (mut device, support) = match Self::create_device(&instance) {
            Ok(created) => created,
            Err(e) => {
                unsafe { instance.destroy() };
                return Err(e);
            }
        };

        let clear_color = config.graphics.clear_color;
        let built = Presentation::build(&instance, &device, &support, window_extent, &shaders, clear_color)
            .and_then(|mut presentation| {
                match FrameScheduler::create(&device.device, presentation.image_count()) {
                    Ok(scheduler) => Ok((presentation, scheduler)),
                    Err(e) => {
                        unsafe { presentation.destroy(&device.device) };
                        Err(e)
                    }
                }
            });

        let (presentation, scheduler) = match built {
            Ok(built) => built,
            Err(e) => {
                unsafe {
                    device.destroy();
                    instance.destroy();
                }
                return Err(e);
            }
        };

        log::info!(
            "Vulkan initialized successfully! {} frames in flight over {} swapchain images",
            MAX_FRAMES_IN_FLIGHT,
            presentation.image_count()
        );

        Ok(Self {
            instance,
            device,
            presentation,
            scheduler,
            shaders,
            clear_color,
            desired_extent: window_extent,
            needs_rebuild: false,
        })
    }

    /// Probe, select and open the device; returns the retained surface snapshot
    fn create_device(instance: &InstanceContext) -> RendererResult<(VulkanDevice, SurfaceSupport)> {
        let report = probe::probe_devices(&instance.instance, &instance.surface_loader, instance.surface)?;
        let selected =
            selector::select_device(report.candidates, report.failures, REQUIRED_DEVICE_EXTENSIONS)?;
        log::info!(
            "Using {} (score {}, graphics family {}, present family {})",
            selected.name,
            selected.score,
            selected.queue_families.graphics,
            selected.queue_families.present
        );
        let device = VulkanDevice::new(&instance.instance, &selected, REQUIRED_DEVICE_EXTENSIONS)?;
        Ok((device, selected.surface))
    }

    /// Note a new window size; the swapchain is rebuilt before the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        self.desired_extent = vk::Extent2D { width, height };
        self.needs_rebuild = true;
    }

    /// Render one frame.
    ///
    /// Returns `false` while the window has no drawable area (minimized);
    /// further frames are pointless until the next [`resize`](Self::resize).
    /// An out-of-date swapchain still returns `true`: it is rebuilt on the
    /// next call.
    pub fn draw_frame(&mut self) -> RendererResult<bool> {
        if !has_drawable_area(self.desired_extent) {
            return Ok(false);
        }

        if self.needs_rebuild && !self.rebuild_swapchain()? {
            return Ok(false);
        }

        let mut driver = DeviceFrameDriver {
            device: &self.device,
            swapchain: &self.presentation.swapchain,
            command_buffers: &self.presentation.commands.buffers,
        };
        let status = self.scheduler.draw_frame(&mut driver)?;

        if status.needs_rebuild() {
            log::debug!("Swapchain reported {:?}, scheduling rebuild", status);
            self.needs_rebuild = true;
        }

        Ok(true)
    }

    /// Quiesce the device and rebuild everything that depends on the extent.
    ///
    /// Returns `false` if the surface currently has no area.
    fn rebuild_swapchain(&mut self) -> RendererResult<bool> {
        let mut driver = DeviceFrameDriver {
            device: &self.device,
            swapchain: &self.presentation.swapchain,
            command_buffers: &self.presentation.commands.buffers,
        };
        self.scheduler.drain(&mut driver)?;

        // Capabilities change with the window, so the startup snapshot is stale here
        let support = SurfaceSupport::query(
            &self.instance.surface_loader,
            self.device.physical_device,
            self.instance.surface,
        )
        .map_err(|result| RendererError::Enumeration {
            context: "surface support",
            result,
        })?;

        if !has_drawable_area(support.capabilities.current_extent) {
            return Ok(false);
        }

        log::info!(
            "Recreating swapchain: {}x{}",
            self.desired_extent.width,
            self.desired_extent.height
        );

        unsafe { self.presentation.destroy(&self.device.device) };
        self.presentation = Presentation::build(
            &self.instance,
            &self.device,
            &support,
            self.desired_extent,
            &self.shaders,
            self.clear_color,
        )?;
        self.scheduler.reset_images(self.presentation.image_count());
        self.needs_rebuild = false;
        log::debug!("Tracking {} swapchain images", self.scheduler.image_count());

        Ok(true)
    }
}

/// A zero-sized extent means there is nothing to present into
fn has_drawable_area(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Nothing may be destroyed while the GPU still uses it
        let mut driver = DeviceFrameDriver {
            device: &self.device,
            swapchain: &self.presentation.swapchain,
            command_buffers: &self.presentation.commands.buffers,
        };
        if let Err(e) = self.scheduler.drain(&mut driver) {
            log::error!("{}", e);
        }

        unsafe {
            // Destroy in reverse order of creation!
            self.scheduler.destroy(&self.device.device);
            self.presentation.destroy(&self.device.device);
            self.device.destroy();
            self.instance.destroy();
        }

        log::info!("Cleanup complete");
    }
}
