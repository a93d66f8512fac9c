// Graphics pipeline creation and management
//
// One render pass with a single color attachment, one fixed pipeline and one
// framebuffer per swapchain image view. Nothing here is mutated after creation;
// a resize rebuilds the whole set.

use ash::vk;

use super::shader::ShaderSet;
use super::swapchain::Swapchain;
use crate::error::{RendererError, RendererResult};

/// Render pass, pipeline and framebuffers bound to one swapchain
pub struct PipelineAssets {
    pub render_pass: vk::RenderPass,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

impl PipelineAssets {
    /// Build everything for `swapchain`, cleaning up partial work on failure
    pub fn new(device: &ash::Device, swapchain: &Swapchain, shaders: &ShaderSet) -> RendererResult<Self> {
        let mut assets = Self {
            render_pass: vk::RenderPass::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            extent: swapchain.extent,
        };

        if let Err(e) = assets.build(device, swapchain, shaders) {
            unsafe { assets.destroy(device) };
            return Err(e);
        }

        log::info!(
            "Created graphics pipeline and {} framebuffers ({}x{})",
            assets.framebuffers.len(),
            assets.extent.width,
            assets.extent.height
        );
        Ok(assets)
    }

    fn build(&mut self, device: &ash::Device, swapchain: &Swapchain, shaders: &ShaderSet) -> RendererResult<()> {
        self.render_pass = create_render_pass(device, swapchain.format)?;

        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        self.pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|result| RendererError::Pipeline {
                context: "pipeline layout",
                result,
            })?;

        self.pipeline = create_graphics_pipeline(
            device,
            self.render_pass,
            self.pipeline_layout,
            swapchain.extent,
            shaders,
        )?;

        for &view in &swapchain.image_views {
            let framebuffer = create_framebuffer(device, self.render_pass, view, swapchain.extent)?;
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Destroy framebuffers, pipeline, layout and render pass.
    ///
    /// # Safety
    /// The GPU must be done with every command buffer that references them.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline, None);
            self.pipeline = vk::Pipeline::null();
        }
        if self.pipeline_layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.pipeline_layout = vk::PipelineLayout::null();
        }
        if self.render_pass != vk::RenderPass::null() {
            device.destroy_render_pass(self.render_pass, None);
            self.render_pass = vk::RenderPass::null();
        }
    }
}

/// The swapchain image: cleared on load, kept on store, handed to present
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()
}

/// Color writes wait for whatever last used the image (the presentation engine)
pub fn external_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build()
}

/// Create a render pass with one color attachment and one subpass
pub fn create_render_pass(device: &ash::Device, format: vk::Format) -> RendererResult<vk::RenderPass> {
    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .build();

    let attachments = [color_attachment(format)];
    let subpasses = [subpass];
    let dependencies = [external_dependency()];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }.map_err(|result| {
        RendererError::Pipeline {
            context: "render pass",
            result,
        }
    })
}

/// Full-extent viewport, depth 0..1
pub fn viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Filled polygons, back faces culled, clockwise is front
pub fn rasterization_state() -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

/// Opaque overwrite, no blending
pub fn color_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()
}

/// Create the fixed graphics pipeline
pub fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    shaders: &ShaderSet,
) -> RendererResult<vk::Pipeline> {
    let vert_module = shaders.vertex.create_module(device)?;
    let frag_module = match shaders.fragment.create_module(device) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vert_module, None) };
            return Err(e);
        }
    };

    let entry_point = c"main";
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(shaders.vertex.stage.flags())
            .module(vert_module)
            .name(entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(shaders.fragment.stage.flags())
            .module(frag_module)
            .name(entry_point)
            .build(),
    ];

    // Vertices come from gl_VertexIndex, nothing is bound
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewports = [viewport(extent)];
    let scissors = [scissor(extent)];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterizer = rasterization_state();

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachments = [color_blend_attachment()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    // Modules are only needed while the pipeline is being built
    unsafe {
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
    }

    let pipelines = result.map_err(|(_, result)| RendererError::Pipeline {
        context: "graphics pipeline",
        result,
    })?;

    pipelines.into_iter().next().ok_or(RendererError::Pipeline {
        context: "graphics pipeline",
        result: vk::Result::ERROR_UNKNOWN,
    })
}

/// Framebuffer over a single swapchain image view
pub fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    image_view: vk::ImageView,
    extent: vk::Extent2D,
) -> RendererResult<vk::Framebuffer> {
    let attachments = [image_view];
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(&attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    unsafe { device.create_framebuffer(&framebuffer_info, None) }.map_err(|result| {
        RendererError::Pipeline {
            context: "framebuffer",
            result,
        }
    })
}
