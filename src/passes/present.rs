//! Present-target pass
//!
//! Blits the composed (and possibly overlaid) output onto the acquired
//! swapchain image with a fullscreen triangle, through per-image aliased
//! framebuffers and a render pass whose final layout is `PRESENT_SRC_KHR`.

use crate::commands::{CommandBuffer, RenderContext};
use crate::descriptor::{DescriptorPool, TextureBinding};
use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use crate::framebuffer::FrameBuffer;
use crate::material::{Material, MaterialInstance};
use crate::swapchain::Swapchain;
use ash::vk;
use std::sync::Arc;

const BLIT_SHADER: &str = r#"
@group(0) @binding(0) var colour_map: texture_2d<f32>;
@group(0) @binding(1) var colour_sampler: sampler;

struct VertexOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOut {
    var out: VertexOut;
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    out.clip_position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(input: VertexOut) -> @location(0) vec4<f32> {
    return textureSample(colour_map, colour_sampler, input.uv);
}
"#;

pub struct PresentPass {
    device: Arc<Device>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<FrameBuffer>,
    command_buffers: Vec<CommandBuffer>,
    material: Arc<Material>,
    instance: MaterialInstance,
}

impl PresentPass {
    pub fn new(
        device: Arc<Device>,
        pool: Arc<DescriptorPool>,
        swapchain: &Swapchain,
        source: &FrameBuffer,
    ) -> RendererResult<Self> {
        let render_pass = Self::create_render_pass(&device, swapchain.format())?;
        let framebuffers = Self::create_framebuffers(&device, render_pass, swapchain)?;

        let mut command_buffers = Vec::with_capacity(framebuffers.len());
        for _ in 0..framebuffers.len() {
            command_buffers.push(CommandBuffer::new(device.clone())?);
        }

        let mut material = Material::new(device.clone(), pool, BLIT_SHADER, render_pass);
        material.setup()?;
        let material = Arc::new(material);

        let mut instance = MaterialInstance::new(material.clone());
        Self::bind_source(&mut instance, source);

        Ok(Self {
            device,
            render_pass,
            framebuffers,
            command_buffers,
            material,
            instance,
        })
    }

    fn create_render_pass(device: &Arc<Device>, format: vk::Format) -> RendererResult<vk::RenderPass> {
        let attachment = vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        };

        let attachment_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };

        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &attachment_ref,
            ..Default::default()
        };

        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ..Default::default()
        };

        let render_pass_info = vk::RenderPassCreateInfo {
            attachment_count: 1,
            p_attachments: &attachment,
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &dependency,
            ..Default::default()
        };

        unsafe {
            device
                .raw()
                .create_render_pass(&render_pass_info, None)
                .map_err(|e| RendererError::FramebufferCreationFailed(e.to_string()))
        }
    }

    fn create_framebuffers(
        device: &Arc<Device>,
        render_pass: vk::RenderPass,
        swapchain: &Swapchain,
    ) -> RendererResult<Vec<FrameBuffer>> {
        let extent = swapchain.extent();
        (0..swapchain.image_count())
            .map(|i| {
                FrameBuffer::create_aliased(
                    device.clone(),
                    extent.width,
                    extent.height,
                    render_pass,
                    &[swapchain.image_view(i)],
                    &[swapchain.format()],
                )
            })
            .collect()
    }

    fn bind_source(instance: &mut MaterialInstance, source: &FrameBuffer) {
        let colour = source
            .attachment("colour")
            .expect("present source has a colour attachment");
        instance.set_texture_uniform(
            "colour_map",
            &[TextureBinding {
                sampler: source.sampler().expect("owned framebuffer has a sampler"),
                view: colour.view(),
            }],
            false,
        );
    }

    /// Rebuilds the per-image framebuffers and rebinds the source after a
    /// swapchain or output recreation. The render pass is kept; the
    /// swapchain format does not change across recreation.
    pub fn recreate(&mut self, swapchain: &Swapchain, source: &FrameBuffer) -> RendererResult<()> {
        self.framebuffers.clear();
        self.framebuffers = Self::create_framebuffers(&self.device, self.render_pass, swapchain)?;
        Self::bind_source(&mut self.instance, source);
        Ok(())
    }

    pub fn build_command_buffer(&mut self, image_index: u32) -> RendererResult<()> {
        let framebuffer = &self.framebuffers[image_index as usize];
        let cmd = &self.command_buffers[image_index as usize];

        cmd.begin_recording()?;
        cmd.begin_render_pass(framebuffer);
        cmd.set_viewport(framebuffer.width() as f32, framebuffer.height() as f32);
        cmd.set_scissor(framebuffer.width(), framebuffer.height());

        let mut ctx = RenderContext::new(cmd);
        self.instance.bind(&mut ctx)?;
        cmd.draw(3);

        cmd.end_render_pass();
        cmd.end_recording()
    }

    pub fn submit(
        &self,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
    ) -> RendererResult<()> {
        self.command_buffers[image_index as usize].submit(wait_semaphores, signal_semaphores)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }
}

impl Drop for PresentPass {
    fn drop(&mut self) {
        self.framebuffers.clear();
        unsafe {
            self.device.raw().destroy_render_pass(self.render_pass, None);
        }
    }
}
