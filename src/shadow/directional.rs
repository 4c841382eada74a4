//! Directional shadow caster
//!
//! Renders the scene depth from a fixed orthographic box aligned to the
//! light direction into a depth-only shadow map at swapchain resolution.
//! Per-renderable uniform buffers and material instances are cached by the
//! renderable's stable id; the scene layer calls
//! [`DirectionalShadow::remove_renderable`] when an object leaves the scene.

use crate::buffer::Buffer;
use crate::commands::{CommandBuffer, RenderContext};
use crate::descriptor::{DescriptorPool, TextureBinding};
use crate::device::Device;
use crate::error::RendererResult;
use crate::framebuffer::{AttachmentSpec, FrameBuffer};
use crate::material::{Material, MaterialInstance};
use crate::scene::{DirectionalLight, RenderObject, RenderableId};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::collections::HashMap;
use std::sync::Arc;

/// Depth-only shadow shader. The vertex inputs mirror the G-buffer layout
/// so both passes consume the same mesh buffers.
const SHADOW_SHADER: &str = r#"
struct ShadowUbo {
    proj: mat4x4<f32>,
    view: mat4x4<f32>,
    model: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> ubo: ShadowUbo;

struct VertexIn {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec3<f32>,
}

@vertex
fn vs_main(input: VertexIn) -> @builtin(position) vec4<f32> {
    return ubo.proj * ubo.view * ubo.model * vec4<f32>(input.position, 1.0);
}

@fragment
fn fs_main() {
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ShadowUniform {
    proj: Mat4,
    view: Mat4,
    model: Mat4,
}

/// Orthographic shadow projection for a directional light, shared with the
/// composition shader's shadow lookup.
pub fn light_view_proj(direction: Vec3) -> Mat4 {
    let proj = Mat4::orthographic_rh(-10.0, 10.0, -10.0, 10.0, -10.0, 20.0);
    let view = Mat4::look_at_rh(direction, Vec3::ZERO, Vec3::Y);
    proj * view
}

struct ObjectEntry {
    uniform: Buffer,
    instance: MaterialInstance,
}

pub struct DirectionalShadow {
    device: Arc<Device>,
    framebuffer: FrameBuffer,
    command_buffer: CommandBuffer,
    semaphore: vk::Semaphore,
    material: Arc<Material>,
    light: DirectionalLight,
    cache: HashMap<RenderableId, ObjectEntry>,
}

impl DirectionalShadow {
    pub fn new(
        device: Arc<Device>,
        pool: Arc<DescriptorPool>,
        width: u32,
        height: u32,
        light: DirectionalLight,
    ) -> RendererResult<Self> {
        let depth_format = device.find_depth_format()?;
        let framebuffer = FrameBuffer::create_owned(
            device.clone(),
            width,
            height,
            &[AttachmentSpec::depth("depth", depth_format)],
        )?;

        let mut material = Material::new(
            device.clone(),
            pool,
            SHADOW_SHADER,
            framebuffer.render_pass(),
        );
        material.setup()?;

        let command_buffer = CommandBuffer::new(device.clone())?;
        let semaphore = device.create_semaphore()?;

        Ok(Self {
            device,
            framebuffer,
            command_buffer,
            semaphore,
            material: Arc::new(material),
            light,
            cache: HashMap::new(),
        })
    }

    pub fn set_light(&mut self, light: DirectionalLight) {
        self.light = light;
    }

    pub fn light(&self) -> &DirectionalLight {
        &self.light
    }

    /// Rebuilds the shadow command buffer against the frame's renderable
    /// snapshot. Cache entries are created on first sight of a renderable
    /// and kept until [`Self::remove_renderable`].
    pub fn build_command_buffer(&mut self, objects: &mut [RenderObject]) -> RendererResult<()> {
        let proj = Mat4::orthographic_rh(-10.0, 10.0, -10.0, 10.0, -10.0, 20.0);
        let view = Mat4::look_at_rh(self.light.direction, Vec3::ZERO, Vec3::Y);

        self.command_buffer.begin_recording()?;
        self.command_buffer.begin_render_pass(&self.framebuffer);
        self.command_buffer.set_viewport(
            self.framebuffer.width() as f32,
            self.framebuffer.height() as f32,
        );
        self.command_buffer
            .set_scissor(self.framebuffer.width(), self.framebuffer.height());

        let mut ctx = RenderContext::new(&self.command_buffer);

        for object in objects {
            if !self.cache.contains_key(&object.id) {
                let uniform = Buffer::new_uniform(
                    self.device.clone(),
                    std::mem::size_of::<ShadowUniform>() as u64,
                    "directional shadow ubo",
                )?;
                let mut instance = MaterialInstance::new(self.material.clone());
                instance.set_buffer_uniform("ubo", &uniform);
                self.cache.insert(object.id, ObjectEntry { uniform, instance });
            }
            let entry = self.cache.get_mut(&object.id).unwrap();

            entry.uniform.write_pod(&ShadowUniform {
                proj,
                view,
                model: object.model,
            });

            for surface in &mut object.surfaces {
                surface.render(&mut ctx, Some(&mut entry.instance))?;
            }
        }

        self.command_buffer.end_render_pass();
        self.command_buffer.end_recording()
    }

    pub fn submit(&self, wait_semaphores: &[vk::Semaphore]) -> RendererResult<()> {
        self.command_buffer
            .submit(wait_semaphores, &[self.semaphore])
    }

    /// Evicts the cached uniform/instance pair for a renderable that left
    /// the scene.
    pub fn remove_renderable(&mut self, id: RenderableId) {
        self.cache.remove(&id);
    }

    pub fn cached_renderables(&self) -> usize {
        self.cache.len()
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Sampler + depth view for the composition pass's shadow map array.
    pub fn shadow_map_binding(&self) -> TextureBinding {
        TextureBinding {
            sampler: self.framebuffer.sampler().expect("owned framebuffer has a sampler"),
            view: self
                .framebuffer
                .attachment("depth")
                .expect("shadow framebuffer has a depth attachment")
                .view(),
        }
    }
}

impl Drop for DirectionalShadow {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_semaphore(self.semaphore, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_view_proj_depends_on_direction() {
        let a = light_view_proj(Vec3::new(0.5, -1.0, 0.5).normalize());
        let b = light_view_proj(Vec3::new(-0.5, -1.0, 0.5).normalize());
        assert_ne!(a, b);

        // A point at the origin lands in the unit volume for any direction
        let clip = a * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(clip.w != 0.0);
    }
}
