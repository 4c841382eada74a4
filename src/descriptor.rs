//! Descriptor layouts, pool and sets
//!
//! Layouts are fed exclusively by reflected bindings: entries are queued
//! with [`DescriptorSetLayout::add_binding`] and finalized by a single
//! `build()`. Sets stage uniform writes by binding name and flush them in
//! slot order on `build()`, allocating from the shared pool on first build.
//! Pool exhaustion is an error; there is no backpressure.

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use crate::reflect::{DescriptorBinding, DescriptorBindingKind};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

fn descriptor_type(kind: DescriptorBindingKind) -> vk::DescriptorType {
    match kind {
        DescriptorBindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorBindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

/// Native layout bindings for a queued set: one entry per unique slot, with
/// stage flags combined when two stages share a slot.
pub(crate) fn layout_bindings(queued: &[DescriptorBinding]) -> Vec<vk::DescriptorSetLayoutBinding> {
    let mut out: Vec<vk::DescriptorSetLayoutBinding> = Vec::new();
    for binding in queued {
        if let Some(existing) = out.iter_mut().find(|b| b.binding == binding.slot) {
            existing.stage_flags |= binding.stage;
            continue;
        }
        out.push(vk::DescriptorSetLayoutBinding {
            binding: binding.slot,
            descriptor_type: descriptor_type(binding.kind),
            descriptor_count: binding.count,
            stage_flags: binding.stage,
            ..Default::default()
        });
    }
    out.sort_by_key(|b| b.binding);
    out
}

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    pending: Vec<DescriptorBinding>,
    built: Option<(vk::DescriptorSetLayout, Vec<DescriptorBinding>)>,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            pending: Vec::new(),
            built: None,
        }
    }

    /// Queues a binding. Must be called before `build()`; bindings queued
    /// after the layout is built do not alter it.
    pub fn add_binding(&mut self, binding: DescriptorBinding) {
        if self.built.is_some() {
            log::warn!(
                "add_binding('{}') after build(), built layout unchanged",
                binding.name
            );
        }
        self.pending.push(binding);
    }

    /// Finalizes the native layout from the queued bindings. Not re-entrant.
    pub fn build(&mut self) -> RendererResult<()> {
        assert!(self.built.is_none(), "DescriptorSetLayout built twice");

        let bindings = layout_bindings(&self.pending);

        let layout_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };

        let layout = unsafe {
            self.device
                .raw()
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| RendererError::PipelineCreationFailed(e.to_string()))?
        };

        self.built = Some((layout, self.pending.clone()));
        Ok(())
    }

    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.built.as_ref().expect("layout not built").0
    }

    /// Bindings the built layout was created from.
    pub fn bindings(&self) -> &[DescriptorBinding] {
        match &self.built {
            Some((_, bindings)) => bindings,
            None => &self.pending,
        }
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if let Some((layout, _)) = self.built.take() {
            unsafe {
                self.device.raw().destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

/// Fixed-capacity descriptor pool shared by every material instance.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    pub fn new(
        device: Arc<Device>,
        num_buffers: u32,
        num_samplers: u32,
        num_sets: u32,
    ) -> RendererResult<Arc<Self>> {
        let mut pool_sizes = Vec::new();
        if num_buffers > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: num_buffers,
            });
        }
        if num_samplers > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: num_samplers,
            });
        }

        let pool_info = vk::DescriptorPoolCreateInfo {
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            max_sets: num_sets,
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            ..Default::default()
        };

        let pool = unsafe {
            device
                .raw()
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
        };

        Ok(Arc::new(Self { device, pool }))
    }

    fn allocate(&self, layout: vk::DescriptorSetLayout) -> RendererResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: self.pool,
            descriptor_set_count: 1,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };

        unsafe {
            match self.device.raw().allocate_descriptor_sets(&alloc_info) {
                Ok(sets) => Ok(sets[0]),
                Err(e @ vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | Err(e @ vk::Result::ERROR_FRAGMENTED_POOL) => {
                    Err(RendererError::DescriptorPoolExhausted(e.to_string()))
                }
                Err(e) => Err(RendererError::InitializationFailed(e.to_string())),
            }
        }
    }

    fn free(&self, set: vk::DescriptorSet) {
        unsafe {
            let _ = self.device.raw().free_descriptor_sets(self.pool, &[set]);
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// One sampler+view pair for a combined-image-sampler slot.
#[derive(Debug, Clone, Copy)]
pub struct TextureBinding {
    pub sampler: vk::Sampler,
    pub view: vk::ImageView,
}

enum BindingValue {
    Buffer(Option<vk::DescriptorBufferInfo>),
    Textures {
        textures: Vec<TextureBinding>,
        is_depth: bool,
    },
}

/// A concrete descriptor set: staged writes by uniform name, flushed in
/// slot order by `build()`.
pub struct DescriptorSet {
    device: Arc<Device>,
    pool: Arc<DescriptorPool>,
    bindings: Vec<DescriptorBinding>,
    values: HashMap<String, BindingValue>,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn new(device: Arc<Device>, pool: Arc<DescriptorPool>, layout: &DescriptorSetLayout) -> Self {
        let bindings = layout.bindings().to_vec();
        let mut values = HashMap::new();
        for binding in &bindings {
            let value = match binding.kind {
                DescriptorBindingKind::UniformBuffer => BindingValue::Buffer(None),
                DescriptorBindingKind::CombinedImageSampler => BindingValue::Textures {
                    textures: Vec::new(),
                    is_depth: false,
                },
            };
            values.insert(binding.name.clone(), value);
        }

        Self {
            device,
            pool,
            bindings,
            values,
            layout: layout.raw(),
            set: vk::DescriptorSet::null(),
        }
    }

    pub fn set_buffer_uniform(&mut self, name: &str, buffer: &Buffer) {
        match self.values.get_mut(name) {
            Some(BindingValue::Buffer(info)) => *info = Some(buffer.descriptor()),
            Some(_) => log::warn!("'{}' is not a uniform buffer binding", name),
            None => log::warn!("Unknown uniform buffer binding '{}'", name),
        }
    }

    /// Accepts an array of sampler+view pairs for sampler-array bindings
    /// (multi shadow caster case). `is_depth` selects the depth read-only
    /// image layout for the write.
    pub fn set_texture_uniform(&mut self, name: &str, textures: &[TextureBinding], is_depth: bool) {
        match self.values.get_mut(name) {
            Some(BindingValue::Textures {
                textures: stored,
                is_depth: stored_depth,
            }) => {
                *stored = textures.to_vec();
                *stored_depth = is_depth;
            }
            Some(_) => log::warn!("'{}' is not a texture binding", name),
            None => log::warn!("Unknown texture binding '{}'", name),
        }
    }

    /// Allocates from the pool if needed, then issues the staged writes in
    /// slot order.
    pub fn build(&mut self) -> RendererResult<()> {
        if self.set == vk::DescriptorSet::null() {
            self.set = self.pool.allocate(self.layout)?;
        }

        let mut sorted: Vec<&DescriptorBinding> = self.bindings.iter().collect();
        sorted.sort_by_key(|b| b.slot);

        // Write payloads must stay alive until the update call.
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut staged: Vec<(u32, vk::DescriptorType, usize)> = Vec::new();

        for binding in &sorted {
            match self.values.get(&binding.name) {
                Some(BindingValue::Buffer(Some(info))) => {
                    buffer_infos.push(*info);
                    staged.push((
                        binding.slot,
                        vk::DescriptorType::UNIFORM_BUFFER,
                        buffer_infos.len() - 1,
                    ));
                }
                Some(BindingValue::Textures { textures, is_depth }) if !textures.is_empty() => {
                    let layout = if *is_depth {
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    };
                    image_infos.push(
                        textures
                            .iter()
                            .map(|t| vk::DescriptorImageInfo {
                                sampler: t.sampler,
                                image_view: t.view,
                                image_layout: layout,
                            })
                            .collect(),
                    );
                    staged.push((
                        binding.slot,
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        image_infos.len() - 1,
                    ));
                }
                _ => {}
            }
        }

        let writes: Vec<vk::WriteDescriptorSet> = staged
            .iter()
            .map(|&(slot, ty, index)| match ty {
                vk::DescriptorType::UNIFORM_BUFFER => vk::WriteDescriptorSet {
                    dst_set: self.set,
                    dst_binding: slot,
                    descriptor_type: ty,
                    descriptor_count: 1,
                    p_buffer_info: &buffer_infos[index],
                    ..Default::default()
                },
                _ => vk::WriteDescriptorSet {
                    dst_set: self.set,
                    dst_binding: slot,
                    descriptor_type: ty,
                    descriptor_count: image_infos[index].len() as u32,
                    p_image_info: image_infos[index].as_ptr(),
                    ..Default::default()
                },
            })
            .collect();

        unsafe {
            self.device.raw().update_descriptor_sets(&writes, &[]);
        }

        Ok(())
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.set
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if self.set != vk::DescriptorSet::null() {
            self.pool.free(self.set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(slot: u32, kind: DescriptorBindingKind, stage: vk::ShaderStageFlags) -> DescriptorBinding {
        DescriptorBinding {
            kind,
            stage,
            slot,
            count: 1,
            name: format!("binding_{}", slot),
        }
    }

    #[test]
    fn layout_binding_count_equals_unique_slots() {
        let queued = vec![
            binding(0, DescriptorBindingKind::UniformBuffer, vk::ShaderStageFlags::VERTEX),
            binding(1, DescriptorBindingKind::CombinedImageSampler, vk::ShaderStageFlags::FRAGMENT),
            // Same slot seen from the other stage
            binding(0, DescriptorBindingKind::UniformBuffer, vk::ShaderStageFlags::FRAGMENT),
        ];

        let native = layout_bindings(&queued);
        assert_eq!(native.len(), 2);

        let shared = native.iter().find(|b| b.binding == 0).unwrap();
        assert!(shared.stage_flags.contains(vk::ShaderStageFlags::VERTEX));
        assert!(shared.stage_flags.contains(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn layout_bindings_sorted_by_slot_with_counts() {
        let mut sampler_array =
            binding(4, DescriptorBindingKind::CombinedImageSampler, vk::ShaderStageFlags::FRAGMENT);
        sampler_array.count = 6;

        let queued = vec![
            sampler_array,
            binding(0, DescriptorBindingKind::UniformBuffer, vk::ShaderStageFlags::VERTEX),
            binding(2, DescriptorBindingKind::CombinedImageSampler, vk::ShaderStageFlags::FRAGMENT),
        ];

        let native = layout_bindings(&queued);
        let slots: Vec<u32> = native.iter().map(|b| b.binding).collect();
        assert_eq!(slots, vec![0, 2, 4]);
        assert_eq!(native[2].descriptor_count, 6);
        assert_eq!(
            native[2].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }
}
