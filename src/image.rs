//! Image helpers: layout transitions and sampled render targets
//!
//! The omni-directional shadow path copies its capture target into cubemap
//! layers with explicit barriers; [`set_image_layout`] records those
//! transitions with access masks derived from the layouts involved.

use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

fn access_mask_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::AccessFlags::empty(),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Records an image memory barrier transitioning `range` of `image` between
/// the two layouts.
pub fn set_image_layout(
    device: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) {
    let barrier = vk::ImageMemoryBarrier {
        src_access_mask: access_mask_for_layout(old_layout),
        dst_access_mask: access_mask_for_layout(new_layout),
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: range,
        ..Default::default()
    };

    unsafe {
        device.raw().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// A sampled image owned outside any framebuffer — used for the omni shadow
/// cubemap.
pub struct Texture {
    device: Arc<Device>,
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    sampler: vk::Sampler,
    format: vk::Format,
    extent: vk::Extent2D,
    layer_count: u32,
}

impl Texture {
    /// 6-layer cube-compatible image with a cube view, transitioned to
    /// shader-read across all layers so the composition pass can sample it
    /// before the first capture lands.
    pub fn new_cubemap(
        device: Arc<Device>,
        size: u32,
        format: vk::Format,
        label: &str,
    ) -> RendererResult<Self> {
        let image_info = vk::ImageCreateInfo {
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: size,
                height: size,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 6,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
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
                name: label,
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

        device.one_time_commands(|cmd| {
            set_image_layout(
                &device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 6,
                },
            );
        })?;

        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::CUBE,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 6,
            },
            ..Default::default()
        };

        let view = unsafe {
            device
                .raw()
                .create_image_view(&view_info, None)
                .map_err(|e| RendererError::ImageCreationFailed(e.to_string()))?
        };

        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: 1.0,
            max_lod: 1.0,
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            ..Default::default()
        };

        let sampler = unsafe {
            device
                .raw()
                .create_sampler(&sampler_info, None)
                .map_err(|e| RendererError::ImageCreationFailed(e.to_string()))?
        };

        Ok(Self {
            device,
            image,
            allocation: Some(allocation),
            view,
            sampler,
            format,
            extent: vk::Extent2D {
                width: size,
                height: size,
            },
            layer_count: 6,
        })
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_sampler(self.sampler, None);
            self.device.raw().destroy_image_view(self.view, None);
            self.device.raw().destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator().lock().free(allocation);
        }
    }
}
