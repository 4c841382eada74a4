//! Pipeline layout and graphics pipeline construction
//!
//! Fixed-function state is uniform across the crate (triangle lists, fill
//! mode, clockwise front face, depth test less-or-equal, dynamic
//! viewport/scissor). Everything variable — vertex input, push-constant
//! ranges, blend-attachment count — comes out of shader reflection.

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use crate::reflect::{PushConstantRange, VertexLayout};
use crate::shader::{FRAGMENT_ENTRY, VERTEX_ENTRY};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    pub fn new(
        device: Arc<Device>,
        descriptor_layout: &DescriptorSetLayout,
        push_constants: &[PushConstantRange],
    ) -> RendererResult<Self> {
        let set_layouts = [descriptor_layout.raw()];

        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|pc| vk::PushConstantRange {
                stage_flags: pc.stage,
                offset: pc.offset,
                size: pc.size,
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            push_constant_range_count: ranges.len() as u32,
            p_push_constant_ranges: ranges.as_ptr(),
            ..Default::default()
        };

        let layout = unsafe {
            device
                .raw()
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| RendererError::PipelineCreationFailed(e.to_string()))?
        };

        Ok(Self { device, layout })
    }

    pub fn raw(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// One blend state per reflected fragment output. Without blending the
/// write mask still has to cover all channels or nothing lands in the
/// attachment.
pub(crate) fn blend_attachment_states(
    num_outputs: u32,
    enable_alpha_blending: bool,
) -> Vec<vk::PipelineColorBlendAttachmentState> {
    (0..num_outputs)
        .map(|_| {
            if enable_alpha_blending {
                vk::PipelineColorBlendAttachmentState {
                    blend_enable: vk::TRUE,
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                    src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
                    dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                    color_blend_op: vk::BlendOp::ADD,
                    src_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                    dst_alpha_blend_factor: vk::BlendFactor::ZERO,
                    alpha_blend_op: vk::BlendOp::ADD,
                }
            } else {
                vk::PipelineColorBlendAttachmentState {
                    blend_enable: vk::FALSE,
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                    ..Default::default()
                }
            }
        })
        .collect()
}

pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<Device>,
        layout: &PipelineLayout,
        shader_module: vk::ShaderModule,
        vertex_layout: Option<&VertexLayout>,
        fragment_output_count: u32,
        render_pass: vk::RenderPass,
        enable_alpha_blending: bool,
        cull_mode: vk::CullModeFlags,
    ) -> RendererResult<Self> {
        let vs_entry = CString::new(VERTEX_ENTRY).unwrap();
        let fs_entry = CString::new(FRAGMENT_ENTRY).unwrap();

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                module: shader_module,
                p_name: vs_entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: shader_module,
                p_name: fs_entry.as_ptr(),
                ..Default::default()
            },
        ];

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart_enable: vk::FALSE,
            ..Default::default()
        };

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_clamp_enable: vk::FALSE,
            line_width: 1.0,
            ..Default::default()
        };

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: vk::TRUE,
            depth_write_enable: vk::TRUE,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            ..Default::default()
        };

        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let multisample_state = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        // Vertex input from reflection; passes drawing generated geometry
        // (fullscreen triangles) come through with no layout at all.
        let mut binding_descriptions = Vec::new();
        let mut attribute_descriptions = Vec::new();
        if let Some(vertex_layout) = vertex_layout {
            if !vertex_layout.inputs.is_empty() {
                binding_descriptions.push(vk::VertexInputBindingDescription {
                    binding: 0,
                    stride: vertex_layout.stride,
                    input_rate: vk::VertexInputRate::VERTEX,
                });
                for input in &vertex_layout.inputs {
                    attribute_descriptions.push(vk::VertexInputAttributeDescription {
                        location: input.location,
                        binding: 0,
                        format: input.format,
                        offset: input.offset,
                    });
                }
            }
        }

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: binding_descriptions.len() as u32,
            p_vertex_binding_descriptions: binding_descriptions.as_ptr(),
            vertex_attribute_description_count: attribute_descriptions.len() as u32,
            p_vertex_attribute_descriptions: attribute_descriptions.as_ptr(),
            ..Default::default()
        };

        let blend_states = blend_attachment_states(fragment_output_count, enable_alpha_blending);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: blend_states.len() as u32,
            p_attachments: blend_states.as_ptr(),
            ..Default::default()
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            stage_count: shader_stages.len() as u32,
            p_stages: shader_stages.as_ptr(),
            p_vertex_input_state: &vertex_input_state,
            p_input_assembly_state: &input_assembly_state,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &rasterization_state,
            p_multisample_state: &multisample_state,
            p_depth_stencil_state: &depth_stencil_state,
            p_color_blend_state: &color_blend_state,
            p_dynamic_state: &dynamic_state,
            layout: layout.raw(),
            render_pass,
            base_pipeline_index: -1,
            ..Default::default()
        };

        let pipeline = unsafe {
            device
                .raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| RendererError::PipelineCreationFailed(e.to_string()))?[0]
        };

        Ok(Self { device, pipeline })
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_pipeline(self.pipeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blending_disabled_produces_one_state_per_output() {
        let states = blend_attachment_states(3, false);
        assert_eq!(states.len(), 3);
        for state in &states {
            assert_eq!(state.blend_enable, vk::FALSE);
            assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
        }
    }

    #[test]
    fn blending_enabled_uses_src_alpha_factors() {
        let states = blend_attachment_states(2, true);
        assert_eq!(states.len(), 2);
        for state in &states {
            assert_eq!(state.blend_enable, vk::TRUE);
            assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
            assert_eq!(
                state.dst_color_blend_factor,
                vk::BlendFactor::ONE_MINUS_SRC_ALPHA
            );
        }
    }
}
