//! GPU buffers backed by gpu-allocator
//!
//! Uniform buffers stay persistently mapped; per-frame uploads are plain
//! memcpys into the mapped slice, the same scheme the rest of the crate
//! relies on for light and per-object data.

use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl Buffer {
    pub fn new(
        device: Arc<Device>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        label: &str,
    ) -> RendererResult<Self> {
        unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };

            let buffer = device
                .raw()
                .create_buffer(&buffer_info, None)
                .map_err(|e| RendererError::BufferCreationFailed(e.to_string()))?;

            let requirements = device.raw().get_buffer_memory_requirements(buffer);

            let allocation = device
                .allocator()
                .lock()
                .allocate(&AllocationCreateDesc {
                    name: label,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| RendererError::BufferCreationFailed(e.to_string()))?;

            device
                .raw()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| RendererError::BufferCreationFailed(e.to_string()))?;

            Ok(Self {
                device,
                buffer,
                allocation: Some(allocation),
                size,
            })
        }
    }

    /// Host-visible, persistently mapped uniform buffer.
    pub fn new_uniform(device: Arc<Device>, size: u64, label: &str) -> RendererResult<Self> {
        Self::new(
            device,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            label,
        )
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if let Some(allocation) = self.allocation.as_mut() {
            if let Some(mapped) = allocation.mapped_slice_mut() {
                let start = offset as usize;
                let end = start + data.len();
                if end <= mapped.len() {
                    mapped[start..end].copy_from_slice(data);
                } else {
                    log::warn!("Buffer write of {} bytes past end of mapping", data.len());
                }
            }
        }
    }

    pub fn write_pod<T: Pod>(&mut self, value: &T) {
        self.write(0, bytemuck::bytes_of(value));
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn descriptor(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.size,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator().lock().free(allocation);
        }
    }
}
