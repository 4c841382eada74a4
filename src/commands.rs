//! Command buffer recording and submission
//!
//! Each pass owns one primary command buffer that is re-recorded every
//! frame. [`RenderContext`] carries the recording-scoped bind-skip cache:
//! material instances consult it so that rebinding the instance that is
//! already active on this command buffer records nothing.

use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use crate::framebuffer::FrameBuffer;
use crate::pipeline::{Pipeline, PipelineLayout};
use ash::vk;
use std::sync::Arc;

pub struct CommandBuffer {
    device: Arc<Device>,
    cmd: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn new(device: Arc<Device>) -> RendererResult<Self> {
        let cmd = device.allocate_command_buffer()?;
        Ok(Self { device, cmd })
    }

    pub fn begin_recording(&self) -> RendererResult<()> {
        unsafe {
            self.device
                .raw()
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RendererError::CommandRecordingFailed(e.to_string()))?;

            let begin_info = vk::CommandBufferBeginInfo::default();
            self.device
                .raw()
                .begin_command_buffer(self.cmd, &begin_info)
                .map_err(|e| RendererError::CommandRecordingFailed(e.to_string()))
        }
    }

    pub fn end_recording(&self) -> RendererResult<()> {
        unsafe {
            self.device
                .raw()
                .end_command_buffer(self.cmd)
                .map_err(|e| RendererError::CommandRecordingFailed(e.to_string()))
        }
    }

    pub fn begin_render_pass(&self, framebuffer: &FrameBuffer) {
        let clear_values = framebuffer.clear_values();

        let begin_info = vk::RenderPassBeginInfo {
            render_pass: framebuffer.render_pass(),
            framebuffer: framebuffer.raw(),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: framebuffer.width(),
                    height: framebuffer.height(),
                },
            },
            clear_value_count: clear_values.len() as u32,
            p_clear_values: clear_values.as_ptr(),
            ..Default::default()
        };

        unsafe {
            self.device
                .raw()
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    pub fn end_render_pass(&self) {
        unsafe {
            self.device.raw().cmd_end_render_pass(self.cmd);
        }
    }

    pub fn set_viewport(&self, width: f32, height: f32) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.raw().cmd_set_viewport(self.cmd, 0, &[viewport]);
        }
    }

    pub fn set_scissor(&self, width: u32, height: u32) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.device.raw().cmd_set_scissor(self.cmd, 0, &[scissor]);
        }
    }

    pub fn bind_pipeline(&self, pipeline: &Pipeline) {
        unsafe {
            self.device.raw().cmd_bind_pipeline(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw(),
            );
        }
    }

    pub fn bind_descriptor_set(&self, layout: &PipelineLayout, set: vk::DescriptorSet) {
        unsafe {
            self.device.raw().cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout.raw(),
                0,
                &[set],
                &[],
            );
        }
    }

    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .raw()
                .cmd_bind_vertex_buffers(self.cmd, 0, &[buffer], &[0]);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .raw()
                .cmd_bind_index_buffer(self.cmd, buffer, 0, vk::IndexType::UINT32);
        }
    }

    pub fn push_constants(&self, layout: &PipelineLayout, stage: vk::ShaderStageFlags, data: &[u8]) {
        unsafe {
            self.device
                .raw()
                .cmd_push_constants(self.cmd, layout.raw(), stage, 0, data);
        }
    }

    pub fn draw_indexed(&self, index_count: u32) {
        unsafe {
            self.device
                .raw()
                .cmd_draw_indexed(self.cmd, index_count, 1, 0, 0, 0);
        }
    }

    pub fn draw(&self, vertex_count: u32) {
        unsafe {
            self.device.raw().cmd_draw(self.cmd, vertex_count, 1, 0, 0);
        }
    }

    /// Submits this buffer on the graphics queue.
    pub fn submit(
        &self,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
    ) -> RendererResult<()> {
        let wait_stages: Vec<vk::PipelineStageFlags> = wait_semaphores
            .iter()
            .map(|_| vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .collect();

        let submit_info = vk::SubmitInfo {
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &self.cmd,
            signal_semaphore_count: signal_semaphores.len() as u32,
            p_signal_semaphores: signal_semaphores.as_ptr(),
            ..Default::default()
        };

        unsafe {
            self.device
                .raw()
                .queue_submit(
                    self.device.graphics_queue(),
                    &[submit_info],
                    vk::Fence::null(),
                )
                .map_err(|e| RendererError::SubmissionFailed(e.to_string()))
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device
                .raw()
                .free_command_buffers(self.device.command_pool(), &[self.cmd]);
        }
    }
}

/// Recording-scoped state threaded through every bind call. Replaces any
/// notion of a renderer-wide "currently bound" pointer: the cache lives and
/// dies with one command buffer's recording.
pub struct RenderContext<'a> {
    cmd: &'a CommandBuffer,
    bound_instance: Option<u64>,
}

impl<'a> RenderContext<'a> {
    pub fn new(cmd: &'a CommandBuffer) -> Self {
        Self {
            cmd,
            bound_instance: None,
        }
    }

    pub fn cmd(&self) -> &CommandBuffer {
        self.cmd
    }

    pub fn is_bound(&self, instance_id: u64) -> bool {
        self.bound_instance == Some(instance_id)
    }

    pub fn note_bound(&mut self, instance_id: u64) {
        self.bound_instance = Some(instance_id);
    }
}

#[cfg(test)]
mod tests {
    // Bind-skip bookkeeping only; actual recording needs a device.
    #[derive(Default)]
    struct BindState {
        bound: Option<u64>,
        binds_recorded: u32,
    }

    impl BindState {
        fn bind(&mut self, id: u64) {
            if self.bound == Some(id) {
                return;
            }
            self.binds_recorded += 1;
            self.bound = Some(id);
        }
    }

    #[test]
    fn rebinding_same_instance_records_nothing() {
        let mut state = BindState::default();
        state.bind(1);
        state.bind(1);
        assert_eq!(state.binds_recorded, 1);
    }

    #[test]
    fn binding_other_instance_invalidates() {
        let mut state = BindState::default();
        state.bind(1);
        state.bind(2);
        state.bind(1);
        assert_eq!(state.binds_recorded, 3);
    }
}
