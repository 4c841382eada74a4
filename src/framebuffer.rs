//! Render-target framebuffers
//!
//! A [`FrameBuffer`] either owns its attachments (offscreen targets: images,
//! views, render pass, sampler) or aliases externally supplied views (the
//! swapchain case) and then never destroys them. Owned render passes carry
//! the external→subpass→external dependency pair that leaves colour
//! attachments in `SHADER_READ_ONLY_OPTIMAL` and depth attachments in
//! `DEPTH_STENCIL_READ_ONLY_OPTIMAL`, so downstream passes can sample them
//! without further barriers.

use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Requested attachment for an owned framebuffer.
#[derive(Debug, Clone)]
pub struct AttachmentSpec {
    pub name: String,
    pub format: vk::Format,
    pub is_depth: bool,
}

impl AttachmentSpec {
    pub fn color(name: &str, format: vk::Format) -> Self {
        Self {
            name: name.to_string(),
            format,
            is_depth: false,
        }
    }

    pub fn depth(name: &str, format: vk::Format) -> Self {
        Self {
            name: name.to_string(),
            format,
            is_depth: true,
        }
    }
}

/// A single render target image + view. `allocation` is `None` for aliased
/// attachments, which are owned elsewhere (e.g. by the swapchain).
pub struct Attachment {
    name: String,
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    format: vk::Format,
    layer_count: u32,
    is_depth: bool,
}

impl Attachment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn is_depth(&self) -> bool {
        self.is_depth
    }
}

/// Render-pass attachment description for an owned framebuffer: clear on
/// load, store on write, and a read-only final layout matching the
/// attachment kind.
pub(crate) fn attachment_description(spec: &AttachmentSpec) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format: spec.format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: if spec.is_depth {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        },
        ..Default::default()
    }
}

pub struct FrameBuffer {
    device: Arc<Device>,
    framebuffer: vk::Framebuffer,
    render_pass: vk::RenderPass,
    attachments: Vec<Attachment>,
    sampler: Option<vk::Sampler>,
    width: u32,
    height: u32,
    owns_resources: bool,
}

impl FrameBuffer {
    /// Allocates images + views for every spec, builds a render pass with
    /// the layout-transition dependency pair and a nearest/clamp sampler.
    /// Any failure propagates; nothing is retried.
    pub fn create_owned(
        device: Arc<Device>,
        width: u32,
        height: u32,
        specs: &[AttachmentSpec],
    ) -> RendererResult<Self> {
        let mut attachments = Vec::with_capacity(specs.len());
        for spec in specs {
            attachments.push(Self::create_attachment(&device, width, height, spec)?);
        }

        let descriptions: Vec<vk::AttachmentDescription> =
            specs.iter().map(attachment_description).collect();

        let mut color_references = Vec::new();
        let mut depth_reference = None;
        for (i, spec) in specs.iter().enumerate() {
            if spec.is_depth {
                depth_reference = Some(vk::AttachmentReference {
                    attachment: i as u32,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                });
            } else {
                color_references.push(vk::AttachmentReference {
                    attachment: i as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
            }
        }

        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: color_references.len() as u32,
            p_color_attachments: color_references.as_ptr(),
            p_depth_stencil_attachment: depth_reference
                .as_ref()
                .map_or(std::ptr::null(), |r| r as *const _),
            ..Default::default()
        };

        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::MEMORY_READ,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::MEMORY_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];

        let render_pass_info = vk::RenderPassCreateInfo {
            attachment_count: descriptions.len() as u32,
            p_attachments: descriptions.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: dependencies.len() as u32,
            p_dependencies: dependencies.as_ptr(),
            ..Default::default()
        };

        let render_pass = unsafe {
            device
                .raw()
                .create_render_pass(&render_pass_info, None)
                .map_err(|e| RendererError::FramebufferCreationFailed(e.to_string()))?
        };

        let views: Vec<vk::ImageView> = attachments.iter().map(|a| a.view).collect();
        let framebuffer = Self::create_raw_framebuffer(&device, render_pass, &views, width, height)?;

        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            mip_lod_bias: 0.0,
            max_anisotropy: 1.0,
            min_lod: 0.0,
            max_lod: 1.0,
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            ..Default::default()
        };

        let sampler = unsafe {
            device
                .raw()
                .create_sampler(&sampler_info, None)
                .map_err(|e| RendererError::FramebufferCreationFailed(e.to_string()))?
        };

        Ok(Self {
            device,
            framebuffer,
            render_pass,
            attachments,
            sampler: Some(sampler),
            width,
            height,
            owns_resources: true,
        })
    }

    /// Wraps pre-existing views (swapchain images, overlay targets) with an
    /// externally owned render pass. Aliased attachments and the render pass
    /// are never destroyed here.
    pub fn create_aliased(
        device: Arc<Device>,
        width: u32,
        height: u32,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        formats: &[vk::Format],
    ) -> RendererResult<Self> {
        assert_eq!(views.len(), formats.len());

        let framebuffer = Self::create_raw_framebuffer(&device, render_pass, views, width, height)?;

        let attachments = views
            .iter()
            .zip(formats.iter())
            .enumerate()
            .map(|(i, (&view, &format))| Attachment {
                name: i.to_string(),
                image: vk::Image::null(),
                allocation: None,
                view,
                format,
                layer_count: 1,
                is_depth: false,
            })
            .collect();

        Ok(Self {
            device,
            framebuffer,
            render_pass,
            attachments,
            sampler: None,
            width,
            height,
            owns_resources: false,
        })
    }

    fn create_attachment(
        device: &Arc<Device>,
        width: u32,
        height: u32,
        spec: &AttachmentSpec,
    ) -> RendererResult<Attachment> {
        let (usage, aspect_mask) = if spec.is_depth {
            (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageAspectFlags::DEPTH,
            )
        } else {
            (
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
            )
        };

        let image_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: spec.format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            // Sampled so later passes can read the target
            usage: usage | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };

        let image = unsafe {
            device
                .raw()
                .create_image(&image_info, None)
                .map_err(|e| RendererError::ImageCreationFailed(e.to_string()))?
        };

        let requirements = unsafe { device.raw().get_image_memory_requirements(image) };

        let allocation = device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: &spec.name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RendererError::ImageCreationFailed(e.to_string()))?;

        unsafe {
            device
                .raw()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| RendererError::ImageCreationFailed(e.to_string()))?;
        }

        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: spec.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };

        let view = unsafe {
            device
                .raw()
                .create_image_view(&view_info, None)
                .map_err(|e| RendererError::ImageCreationFailed(e.to_string()))?
        };

        Ok(Attachment {
            name: spec.name.clone(),
            image,
            allocation: Some(allocation),
            view,
            format: spec.format,
            layer_count: 1,
            is_depth: spec.is_depth,
        })
    }

    fn create_raw_framebuffer(
        device: &Arc<Device>,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> RendererResult<vk::Framebuffer> {
        let framebuffer_info = vk::FramebufferCreateInfo {
            render_pass,
            attachment_count: views.len() as u32,
            p_attachments: views.as_ptr(),
            width,
            height,
            layers: 1,
            ..Default::default()
        };

        unsafe {
            device
                .raw()
                .create_framebuffer(&framebuffer_info, None)
                .map_err(|e| RendererError::FramebufferCreationFailed(e.to_string()))
        }
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// One clear value per attachment, in attachment order.
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        self.attachments
            .iter()
            .map(|a| {
                if a.is_depth {
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    }
                } else {
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: [0.0, 0.0, 0.0, 0.0],
                        },
                    }
                }
            })
            .collect()
    }

    pub fn raw(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_framebuffer(self.framebuffer, None);

            if self.owns_resources {
                for attachment in &mut self.attachments {
                    self.device.raw().destroy_image_view(attachment.view, None);
                    self.device.raw().destroy_image(attachment.image, None);
                    if let Some(allocation) = attachment.allocation.take() {
                        let _ = self.device.allocator().lock().free(allocation);
                    }
                }
                if let Some(sampler) = self.sampler {
                    self.device.raw().destroy_sampler(sampler, None);
                }
                self.device.raw().destroy_render_pass(self.render_pass, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_attachment_final_layout_is_read_only() {
        let spec = AttachmentSpec::depth("depth", vk::Format::D32_SFLOAT);
        let desc = attachment_description(&spec);
        assert_eq!(
            desc.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_ne!(desc.final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(spec.is_depth);
    }

    #[test]
    fn color_attachment_final_layout_is_shader_read() {
        let spec = AttachmentSpec::color("position", vk::Format::R16G16B16A16_SFLOAT);
        let desc = attachment_description(&spec);
        assert_eq!(desc.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(desc.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(desc.store_op, vk::AttachmentStoreOp::STORE);
    }
}
