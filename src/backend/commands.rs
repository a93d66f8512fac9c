// Command pool and prerecorded command buffers
//
// One primary command buffer per framebuffer, recorded once: begin the render
// pass with a clear, bind the pipeline, draw 3 vertices, end. The buffers are
// only re-recorded when the swapchain is rebuilt.

use ash::vk;

use super::pipeline::PipelineAssets;
use crate::error::{RendererError, RendererResult};

pub struct FrameCommands {
    pub pool: vk::CommandPool,
    /// Indexed by swapchain image
    pub buffers: Vec<vk::CommandBuffer>,
}

impl FrameCommands {
    pub fn new(device: &ash::Device, graphics_family: u32) -> RendererResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(graphics_family);

        let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|result| {
            RendererError::Pipeline {
                context: "command pool",
                result,
            }
        })?;

        Ok(Self {
            pool,
            buffers: Vec::new(),
        })
    }

    /// Allocate and record one command buffer per framebuffer
    pub fn record(
        &mut self,
        device: &ash::Device,
        assets: &PipelineAssets,
        clear_color: [f32; 4],
    ) -> RendererResult<()> {
        self.free_buffers(device);

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(assets.framebuffers.len() as u32);

        self.buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(|result| {
            RendererError::Pipeline {
                context: "command buffer allocation",
                result,
            }
        })?;

        for (&cmd, &framebuffer) in self.buffers.iter().zip(&assets.framebuffers) {
            record_triangle(device, cmd, assets, framebuffer, clear_color).map_err(|result| {
                RendererError::Pipeline {
                    context: "command buffer recording",
                    result,
                }
            })?;
        }

        log::info!("Created {} pre-recorded command buffers", self.buffers.len());
        Ok(())
    }

    /// Return the buffers to the pool.
    ///
    /// The GPU must not be executing any of them.
    pub fn free_buffers(&mut self, device: &ash::Device) {
        if !self.buffers.is_empty() {
            unsafe { device.free_command_buffers(self.pool, &self.buffers) };
            self.buffers.clear();
        }
    }

    /// Destroy the pool (which frees its buffers).
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.buffers.clear();
        device.destroy_command_pool(self.pool, None);
        self.pool = vk::CommandPool::null();
    }
}

fn record_triangle(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    assets: &PipelineAssets,
    framebuffer: vk::Framebuffer,
    clear_color: [f32; 4],
) -> ash::prelude::VkResult<()> {
    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: clear_color,
        },
    }];

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(assets.render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: assets.extent,
        })
        .clear_values(&clear_values);

    unsafe {
        device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())?;
        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, assets.pipeline);
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd)
    }
}
