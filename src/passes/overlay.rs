//! Overlay (UI) pass
//!
//! The UI layer lives outside this crate and records through the
//! [`OverlayHook`] trait. The pass renders over the composition output:
//! its render pass loads the existing colour contents and returns them to
//! shader-read for the present blit.

use crate::commands::CommandBuffer;
use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use crate::framebuffer::FrameBuffer;
use ash::vk;
use std::sync::Arc;

/// Externally implemented UI recorder, called inside the overlay render
/// pass with the pass's command buffer and target extent.
pub trait OverlayHook {
    fn record(&mut self, cmd: &CommandBuffer, extent: vk::Extent2D);
}

pub struct OverlayPass {
    device: Arc<Device>,
    render_pass: vk::RenderPass,
    framebuffer: FrameBuffer,
    command_buffer: CommandBuffer,
    semaphore: vk::Semaphore,
}

impl OverlayPass {
    pub fn new(device: Arc<Device>, target: &FrameBuffer) -> RendererResult<Self> {
        let colour = target
            .attachment("colour")
            .ok_or_else(|| {
                RendererError::FramebufferCreationFailed(
                    "Overlay target has no colour attachment".into(),
                )
            })?;

        let render_pass = Self::create_render_pass(&device, colour.format())?;
        let framebuffer = Self::create_framebuffer(&device, render_pass, target)?;
        let command_buffer = CommandBuffer::new(device.clone())?;
        let semaphore = device.create_semaphore()?;

        Ok(Self {
            device,
            render_pass,
            framebuffer,
            command_buffer,
            semaphore,
        })
    }

    /// Loads and preserves the composed image under the UI.
    fn create_render_pass(device: &Arc<Device>, format: vk::Format) -> RendererResult<vk::RenderPass> {
        let attachment = vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
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

        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::SHADER_READ,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];

        let render_pass_info = vk::RenderPassCreateInfo {
            attachment_count: 1,
            p_attachments: &attachment,
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: dependencies.len() as u32,
            p_dependencies: dependencies.as_ptr(),
            ..Default::default()
        };

        unsafe {
            device
                .raw()
                .create_render_pass(&render_pass_info, None)
                .map_err(|e| RendererError::FramebufferCreationFailed(e.to_string()))
        }
    }

    fn create_framebuffer(
        device: &Arc<Device>,
        render_pass: vk::RenderPass,
        target: &FrameBuffer,
    ) -> RendererResult<FrameBuffer> {
        let colour = target
            .attachment("colour")
            .expect("overlay target has a colour attachment");
        FrameBuffer::create_aliased(
            device.clone(),
            target.width(),
            target.height(),
            render_pass,
            &[colour.view()],
            &[colour.format()],
        )
    }

    /// Rebuilds the aliased framebuffer after the composition target was
    /// recreated.
    pub fn recreate(&mut self, target: &FrameBuffer) -> RendererResult<()> {
        self.framebuffer = Self::create_framebuffer(&self.device, self.render_pass, target)?;
        Ok(())
    }

    pub fn build_command_buffer(&mut self, hook: &mut dyn OverlayHook) -> RendererResult<()> {
        let extent = vk::Extent2D {
            width: self.framebuffer.width(),
            height: self.framebuffer.height(),
        };

        self.command_buffer.begin_recording()?;
        self.command_buffer.begin_render_pass(&self.framebuffer);
        self.command_buffer
            .set_viewport(extent.width as f32, extent.height as f32);
        self.command_buffer.set_scissor(extent.width, extent.height);

        hook.record(&self.command_buffer, extent);

        self.command_buffer.end_render_pass();
        self.command_buffer.end_recording()
    }

    pub fn submit(&self, wait_semaphores: &[vk::Semaphore]) -> RendererResult<()> {
        self.command_buffer
            .submit(wait_semaphores, &[self.semaphore])
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for OverlayPass {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_semaphore(self.semaphore, None);
            self.device.raw().destroy_render_pass(self.render_pass, None);
        }
    }
}
