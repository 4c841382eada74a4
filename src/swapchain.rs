//! Swapchain management
//!
//! Recreation is stop-the-world: the device is idled, the old chain torn
//! down and a new one built. Acquire maps `ERROR_OUT_OF_DATE_KHR` to
//! [`RendererError::SwapchainOutOfDate`] so the frame loop can skip the
//! frame; `SUBOPTIMAL` at acquire proceeds with the current image.

use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use ash::khr::swapchain;
use ash::vk;
use std::sync::Arc;

pub struct Swapchain {
    device: Arc<Device>,
    swapchain_fn: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    vsync: bool,
}

impl Swapchain {
    pub fn new(device: Arc<Device>, width: u32, height: u32, vsync: bool) -> RendererResult<Self> {
        let swapchain_fn = swapchain::Device::new(device.instance(), device.raw());

        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;

        let mut sc = Self {
            device,
            swapchain_fn,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D { width: 0, height: 0 },
            image_available,
            render_finished,
            vsync,
        };
        sc.recreate(width, height)?;
        Ok(sc)
    }

    /// Tears down and rebuilds the chain at the given size. The device is
    /// idled first, so no submission may be in flight.
    pub fn recreate(&mut self, width: u32, height: u32) -> RendererResult<()> {
        unsafe {
            self.device.wait_idle();

            for &view in &self.image_views {
                self.device.raw().destroy_image_view(view, None);
            }
            self.image_views.clear();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            }

            let capabilities = self
                .device
                .surface_fn()
                .get_physical_device_surface_capabilities(
                    self.device.physical_device(),
                    self.device.surface(),
                )
                .map_err(|e| RendererError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .device
                .surface_fn()
                .get_physical_device_surface_formats(
                    self.device.physical_device(),
                    self.device.surface(),
                )
                .map_err(|e| RendererError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .device
                .surface_fn()
                .get_physical_device_surface_present_modes(
                    self.device.physical_device(),
                    self.device.surface(),
                )
                .map_err(|e| RendererError::SwapchainCreationFailed(e.to_string()))?;

            // Prefer SRGB
            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(&formats[0]);

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let swapchain_info = vk::SwapchainCreateInfoKHR {
                surface: self.device.surface(),
                min_image_count: image_count,
                image_format: format.format,
                image_color_space: format.color_space,
                image_extent: extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform: capabilities.current_transform,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                present_mode,
                clipped: vk::TRUE,
                ..Default::default()
            };

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| RendererError::SwapchainCreationFailed(e.to_string()))?;

            self.images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| RendererError::SwapchainCreationFailed(e.to_string()))?;

            self.format = format.format;
            self.extent = extent;

            self.image_views = self
                .images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo {
                        image,
                        view_type: vk::ImageViewType::TYPE_2D,
                        format: format.format,
                        components: vk::ComponentMapping::default(),
                        subresource_range: vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        ..Default::default()
                    };
                    self.device.raw().create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RendererError::SwapchainCreationFailed(e.to_string()))?;

            log::debug!(
                "Swapchain created: {}x{} ({} images)",
                extent.width,
                extent.height,
                self.images.len()
            );

            Ok(())
        }
    }

    /// Blocks (unbounded timeout) until an image is available.
    pub fn acquire(&mut self) -> RendererResult<u32> {
        unsafe {
            match self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available,
                vk::Fence::null(),
            ) {
                Ok((image_index, _suboptimal)) => Ok(image_index),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RendererError::SwapchainOutOfDate),
                Err(e) => Err(RendererError::AcquireImageFailed(e.to_string())),
            }
        }
    }

    /// Returns `true` when the chain should be recreated.
    pub fn present(&mut self, image_index: u32) -> RendererResult<bool> {
        let wait_semaphores = [self.render_finished];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            swapchain_count: 1,
            p_swapchains: swapchains.as_ptr(),
            p_image_indices: image_indices.as_ptr(),
            ..Default::default()
        };

        unsafe {
            match self
                .swapchain_fn
                .queue_present(self.device.graphics_queue(), &present_info)
            {
                Ok(suboptimal) => Ok(suboptimal),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
                Err(e) => Err(RendererError::PresentFailed(e.to_string())),
            }
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_view(&self, index: usize) -> vk::ImageView {
        self.image_views[index]
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_available_semaphore(&self) -> vk::Semaphore {
        self.image_available
    }

    pub fn render_finished_semaphore(&self) -> vk::Semaphore {
        self.render_finished
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.device.wait_idle();
            for &view in &self.image_views {
                self.device.raw().destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            }
            self.device
                .raw()
                .destroy_semaphore(self.image_available, None);
            self.device
                .raw()
                .destroy_semaphore(self.render_finished, None);
        }
    }
}
