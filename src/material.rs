//! Materials and per-surface material instances
//!
//! A [`Material`] is a shader/pipeline pair whose every layout decision is
//! pulled from reflection at `setup()` time; after that it is immutable and
//! shared (`Arc`) by any number of instances. A [`MaterialInstance`] owns
//! the descriptor set for one surface. Uniform updates mark the instance
//! dirty; the descriptor set is rebuilt lazily at the next `bind`, never
//! mid-frame while the GPU may still be reading it.

use crate::buffer::Buffer;
use crate::commands::RenderContext;
use crate::descriptor::{DescriptorPool, DescriptorSet, DescriptorSetLayout, TextureBinding};
use crate::device::Device;
use crate::error::RendererResult;
use crate::pipeline::{Pipeline, PipelineLayout};
use crate::reflect::ShaderReflection;
use crate::shader::{compile_wgsl, create_shader_module};
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

pub struct Material {
    device: Arc<Device>,
    pool: Arc<DescriptorPool>,
    source: String,
    render_pass: vk::RenderPass,
    cull_mode: vk::CullModeFlags,
    enable_alpha_blending: bool,

    shader_module: Option<vk::ShaderModule>,
    vertex_reflection: Option<ShaderReflection>,
    fragment_reflection: Option<ShaderReflection>,
    descriptor_layout: Option<DescriptorSetLayout>,
    pipeline_layout: Option<PipelineLayout>,
    pipeline: Option<Pipeline>,
}

impl Material {
    pub fn new(
        device: Arc<Device>,
        pool: Arc<DescriptorPool>,
        source: &str,
        render_pass: vk::RenderPass,
    ) -> Self {
        Self {
            device,
            pool,
            source: source.to_string(),
            render_pass,
            cull_mode: vk::CullModeFlags::BACK,
            enable_alpha_blending: false,
            shader_module: None,
            vertex_reflection: None,
            fragment_reflection: None,
            descriptor_layout: None,
            pipeline_layout: None,
            pipeline: None,
        }
    }

    pub fn set_cull_mode(&mut self, cull_mode: vk::CullModeFlags) {
        self.cull_mode = cull_mode;
    }

    pub fn set_alpha_blending(&mut self, enabled: bool) {
        self.enable_alpha_blending = enabled;
    }

    /// Idempotent: compiles + reflects the shader stages, builds the
    /// descriptor layout from the merged bindings, then the pipeline with
    /// the reflected vertex layout and blend-attachment count — each only
    /// if not already present.
    pub fn setup(&mut self) -> RendererResult<()> {
        if self.shader_module.is_none() {
            let spirv = compile_wgsl(&self.source)?;
            self.vertex_reflection =
                Some(ShaderReflection::from_spirv(&spirv, vk::ShaderStageFlags::VERTEX)?);
            self.fragment_reflection = Some(ShaderReflection::from_spirv(
                &spirv,
                vk::ShaderStageFlags::FRAGMENT,
            )?);
            self.shader_module = Some(create_shader_module(&self.device, &spirv)?);
        }

        let vertex = self.vertex_reflection.as_ref().unwrap();
        let fragment = self.fragment_reflection.as_ref().unwrap();

        if self.descriptor_layout.is_none() {
            let merged = vertex.bindings.merge(&fragment.bindings);
            let mut layout = DescriptorSetLayout::new(self.device.clone());
            for binding in merged.iter() {
                layout.add_binding(binding.clone());
            }
            layout.build()?;
            self.descriptor_layout = Some(layout);
        }

        if self.pipeline_layout.is_none() {
            let mut push_constants = vertex.push_constants.clone();
            push_constants.extend(fragment.push_constants.iter().cloned());
            self.pipeline_layout = Some(PipelineLayout::new(
                self.device.clone(),
                self.descriptor_layout.as_ref().unwrap(),
                &push_constants,
            )?);
        }

        if self.pipeline.is_none() {
            self.pipeline = Some(Pipeline::new(
                self.device.clone(),
                self.pipeline_layout.as_ref().unwrap(),
                self.shader_module.unwrap(),
                vertex.vertex_layout.as_ref(),
                fragment.fragment_output_count,
                self.render_pass,
                self.enable_alpha_blending,
                self.cull_mode,
            )?);
        }

        Ok(())
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.pipeline.as_ref().expect("Material::setup not called")
    }

    pub fn pipeline_layout(&self) -> &PipelineLayout {
        self.pipeline_layout
            .as_ref()
            .expect("Material::setup not called")
    }

    pub fn descriptor_layout(&self) -> &DescriptorSetLayout {
        self.descriptor_layout
            .as_ref()
            .expect("Material::setup not called")
    }

    pub fn descriptor_pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        if let Some(module) = self.shader_module.take() {
            unsafe {
                self.device.raw().destroy_shader_module(module, None);
            }
        }
    }
}

pub struct MaterialInstance {
    id: u64,
    material: Arc<Material>,
    descriptor_set: DescriptorSet,
    dirty: bool,
}

impl MaterialInstance {
    pub fn new(material: Arc<Material>) -> Self {
        let descriptor_set = DescriptorSet::new(
            material.device().clone(),
            material.descriptor_pool().clone(),
            material.descriptor_layout(),
        );

        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            material,
            descriptor_set,
            dirty: true,
        }
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    pub fn set_buffer_uniform(&mut self, name: &str, buffer: &Buffer) {
        self.descriptor_set.set_buffer_uniform(name, buffer);
        self.dirty = true;
    }

    pub fn set_texture_uniform(&mut self, name: &str, textures: &[TextureBinding], is_depth: bool) {
        self.descriptor_set.set_texture_uniform(name, textures, is_depth);
        self.dirty = true;
    }

    /// No-op when this instance is already bound on the context. Otherwise
    /// rebuilds the descriptor set if dirty, then records the pipeline and
    /// descriptor-set binds.
    pub fn bind(&mut self, ctx: &mut RenderContext) -> RendererResult<()> {
        if ctx.is_bound(self.id) {
            return Ok(());
        }

        if self.dirty {
            self.descriptor_set.build()?;
            self.dirty = false;
        }

        ctx.cmd().bind_pipeline(self.material.pipeline());
        ctx.cmd()
            .bind_descriptor_set(self.material.pipeline_layout(), self.descriptor_set.raw());
        ctx.note_bound(self.id);
        Ok(())
    }
}
