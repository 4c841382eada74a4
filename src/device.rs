//! Vulkan instance, device and queue setup
//!
//! One [`Device`] is created per window surface and shared (`Arc`) by every
//! GPU object in the crate. Device selection requires a single queue family
//! with both graphics and present support; everything is recorded and
//! submitted on that one queue.

use crate::error::{RendererError, RendererResult};
use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// Owns the Vulkan instance, surface, logical device, graphics queue,
/// allocator and command pool.
pub struct Device {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    allocator: Option<Arc<Mutex<Allocator>>>,
    command_pool: vk::CommandPool,
}

impl Device {
    pub fn new<W>(window: &W) -> RendererResult<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

            let app_name = CStr::from_bytes_with_nul(b"Ashen\0").unwrap();

            let app_info = vk::ApplicationInfo {
                p_application_name: app_name.as_ptr(),
                application_version: vk::make_api_version(0, 1, 0, 0),
                p_engine_name: app_name.as_ptr(),
                engine_version: vk::make_api_version(0, 1, 0, 0),
                api_version: vk::API_VERSION_1_2,
                ..Default::default()
            };

            let display_handle = window
                .display_handle()
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo {
                p_application_info: &app_info,
                enabled_extension_count: extensions.len() as u32,
                pp_enabled_extension_names: extensions.as_ptr(),
                ..Default::default()
            };

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| RendererError::SurfaceCreationFailed(e.to_string()))?;

            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

            let physical_device = physical_devices
                .into_iter()
                .find(|&pd| Self::find_queue_family(&instance, pd, &surface_fn, surface).is_some())
                .ok_or_else(|| {
                    RendererError::InitializationFailed("No suitable physical device".into())
                })?;

            let graphics_queue_family =
                Self::find_queue_family(&instance, physical_device, &surface_fn, surface)
                    .ok_or_else(|| {
                        RendererError::InitializationFailed("No suitable queue family".into())
                    })?;

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo {
                queue_family_index: graphics_queue_family,
                queue_count: 1,
                p_queue_priorities: queue_priorities.as_ptr(),
                ..Default::default()
            };

            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();

            let device_info = vk::DeviceCreateInfo {
                queue_create_info_count: 1,
                p_queue_create_infos: &queue_info,
                enabled_extension_count: device_extensions.len() as u32,
                pp_enabled_extension_names: device_extensions.as_ptr(),
                p_enabled_features: &device_features,
                ..Default::default()
            };

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| RendererError::DeviceCreationFailed(e.to_string()))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: graphics_queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };

            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

            log::info!(
                "Vulkan device initialized (queue family {})",
                graphics_queue_family
            );

            Ok(Arc::new(Self {
                _entry: entry,
                instance,
                surface_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                graphics_queue_family,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                command_pool,
            }))
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        for (index, family) in queue_families.iter().enumerate() {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };

            if supports_graphics && supports_surface {
                return Some(index as u32);
            }
        }
        None
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_fn(&self) -> &surface::Instance {
        &self.surface_fn
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn allocator(&self) -> Arc<Mutex<Allocator>> {
        self.allocator.clone().expect("Allocator already dropped")
    }

    pub fn create_semaphore(&self) -> RendererResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        unsafe {
            self.device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))
        }
    }

    pub fn allocate_command_buffer(&self) -> RendererResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };

        unsafe {
            Ok(self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?[0])
        }
    }

    /// Records `record` into a one-shot command buffer, submits it and waits
    /// for the queue to drain. Used for image layout setup and copies that
    /// happen outside the frame loop.
    pub fn one_time_commands<F>(&self, record: F) -> RendererResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe {
            let cmd = self.allocate_command_buffer()?;

            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| RendererError::CommandRecordingFailed(e.to_string()))?;

            record(cmd);

            self.device
                .end_command_buffer(cmd)
                .map_err(|e| RendererError::CommandRecordingFailed(e.to_string()))?;

            let submit_info = vk::SubmitInfo {
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };

            self.device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                .map_err(|e| RendererError::SubmissionFailed(e.to_string()))?;
            self.device
                .queue_wait_idle(self.graphics_queue)
                .map_err(|e| RendererError::SubmissionFailed(e.to_string()))?;

            self.device.free_command_buffers(self.command_pool, &[cmd]);
            Ok(())
        }
    }

    /// First depth format supported with optimal tiling, preferring the
    /// highest precision.
    pub fn find_depth_format(&self) -> RendererResult<vk::Format> {
        let candidates = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];

        for format in candidates {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            };
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                return Ok(format);
            }
        }

        Err(RendererError::InitializationFailed(
            "No supported depth format".into(),
        ))
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }

    /// Blocks until the graphics/present queue drains.
    pub fn wait_queue_idle(&self) -> RendererResult<()> {
        unsafe {
            self.device
                .queue_wait_idle(self.graphics_queue)
                .map_err(|e| RendererError::SubmissionFailed(e.to_string()))
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // The allocator must go before the device it was created from.
            drop(self.allocator.take());

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
