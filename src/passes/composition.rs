//! Composition (deferred lighting) pass
//!
//! Draws a fullscreen quad that shades the G-buffer with the active lights
//! and shadow maps into the output target. Light and shadow counts are
//! baked into the shader as constants, so the material is rebuilt only when
//! those counts change or the shadow manager reports the shadow set out of
//! date — never per frame. The rebuild path is the one place that
//! acknowledges the shadow manager.

use crate::buffer::Buffer;
use crate::commands::{CommandBuffer, RenderContext};
use crate::descriptor::{DescriptorPool, TextureBinding};
use crate::device::Device;
use crate::error::RendererResult;
use crate::framebuffer::{AttachmentSpec, FrameBuffer};
use crate::material::{Material, MaterialInstance};
use crate::scene::{light_counts, Light, LightsUniform};
use crate::shader::ShaderSettings;
use crate::shadow::ShadowManager;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

const COMPOSITION_SHADER: &str = r#"
struct Globals {
    proj: mat4x4<f32>,
    model: mat4x4<f32>,
}

struct PointLight {
    position: vec4<f32>,
    colour: vec4<f32>,
}

struct DirectionalLight {
    direction: vec4<f32>,
    colour: vec4<f32>,
    view_proj: mat4x4<f32>,
}

struct Lights {
    point_lights: array<PointLight, 16>,
    directional_lights: array<DirectionalLight, 4>,
    view_position: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var position_map: texture_2d<f32>;
@group(0) @binding(2) var position_sampler: sampler;
@group(0) @binding(3) var normal_map: texture_2d<f32>;
@group(0) @binding(4) var normal_sampler: sampler;
@group(0) @binding(5) var albedo_map: texture_2d<f32>;
@group(0) @binding(6) var albedo_sampler: sampler;
@group(0) @binding(7) var<uniform> lights: Lights;
@group(0) @binding(8) var dir_shadow_maps: binding_array<texture_depth_2d, DIR_SHADOW_MAP_COUNT>;
@group(0) @binding(9) var dir_shadow_sampler: sampler;
@group(0) @binding(10) var omni_shadow_maps: binding_array<texture_cube<f32>, OMNI_SHADOW_MAP_COUNT>;
@group(0) @binding(11) var omni_shadow_sampler: sampler;

struct VertexIn {
    @location(0) position: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

struct VertexOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(input: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip_position = globals.proj * globals.model * vec4<f32>(input.position, 1.0);
    out.uv = input.uv;
    return out;
}

fn directional_shadow(index: i32, world_position: vec3<f32>) -> f32 {
    let clip = lights.directional_lights[index].view_proj * vec4<f32>(world_position, 1.0);
    let ndc = clip.xyz / clip.w;
    let uv = ndc.xy * vec2<f32>(0.5, -0.5) + vec2<f32>(0.5, 0.5);
    if (uv.x < 0.0 || uv.x > 1.0 || uv.y < 0.0 || uv.y > 1.0) {
        return 1.0;
    }
    let stored = textureSampleLevel(dir_shadow_maps[index], dir_shadow_sampler, uv, 0);
    if (ndc.z - 0.002 > stored) {
        return 0.15;
    }
    return 1.0;
}

fn omni_shadow(index: i32, world_position: vec3<f32>) -> f32 {
    let to_fragment = world_position - lights.point_lights[index].position.xyz;
    let stored = textureSampleLevel(omni_shadow_maps[index], omni_shadow_sampler, to_fragment, 0.0).r;
    if (length(to_fragment) - 0.05 > stored) {
        return 0.15;
    }
    return 1.0;
}

@fragment
fn fs_main(input: VertexOut) -> @location(0) vec4<f32> {
    let world_position = textureSample(position_map, position_sampler, input.uv).xyz;
    let normal = normalize(textureSample(normal_map, normal_sampler, input.uv).xyz);
    let albedo = textureSample(albedo_map, albedo_sampler, input.uv);

    var colour = albedo.rgb * 0.1;

    for (var i = 0; i < NUM_POINT_LIGHTS; i = i + 1) {
        let light = lights.point_lights[i];
        let to_light = light.position.xyz - world_position;
        let dist = length(to_light);
        let radius = light.position.w;
        let attenuation = radius / (pow(dist, 2.0) + 1.0);
        let diffuse = max(dot(normal, normalize(to_light)), 0.0);

        var shadow = 1.0;
        if (i < NUM_OMNI_SHADOWS) {
            shadow = omni_shadow(i, world_position);
        }
        colour += albedo.rgb * light.colour.rgb * diffuse * attenuation * shadow;
    }

    for (var i = 0; i < NUM_DIR_LIGHTS; i = i + 1) {
        let light = lights.directional_lights[i];
        let diffuse = max(dot(normal, normalize(-light.direction.xyz)), 0.0);

        var shadow = 1.0;
        if (i < NUM_DIR_SHADOWS) {
            shadow = directional_shadow(i, world_position);
        }
        colour += albedo.rgb * light.colour.rgb * diffuse * shadow;
    }

    return vec4<f32>(colour, 1.0);
}
"#;

/// Shader constants for the current scene composition. Loop bounds carry
/// the real counts; the sampler-array extents stay at least one because a
/// zero-sized binding array is not declarable.
pub(crate) fn composition_settings(
    point_lights: usize,
    directional_lights: usize,
    directional_shadows: usize,
    omni_shadows: usize,
) -> ShaderSettings {
    let mut settings = ShaderSettings::new();
    settings.set_int("NUM_POINT_LIGHTS", point_lights as i64);
    settings.set_int("NUM_DIR_LIGHTS", directional_lights as i64);
    settings.set_int("NUM_DIR_SHADOWS", directional_shadows as i64);
    settings.set_int("NUM_OMNI_SHADOWS", omni_shadows as i64);
    settings.set_int("DIR_SHADOW_MAP_COUNT", directional_shadows.max(1) as i64);
    settings.set_int("OMNI_SHADOW_MAP_COUNT", omni_shadows.max(1) as i64);
    settings
}

/// The material is rebuilt when it does not exist yet, when the baked
/// constants changed, or when the shadow registry is out of date.
pub(crate) fn needs_rebuild(
    current: Option<&ShaderSettings>,
    next: &ShaderSettings,
    shadows_out_of_date: bool,
) -> bool {
    match current {
        None => true,
        Some(current) => current != next || shadows_out_of_date,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 3],
    uv: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GlobalsUniform {
    proj: Mat4,
    model: Mat4,
}

pub struct CompositionPass {
    device: Arc<Device>,
    pool: Arc<DescriptorPool>,
    framebuffer: FrameBuffer,
    command_buffer: CommandBuffer,
    semaphore: vk::Semaphore,

    quad_vertices: Buffer,
    quad_indices: Buffer,
    quad_index_count: u32,

    globals: Buffer,
    lights: Buffer,

    material: Option<Arc<Material>>,
    instance: Option<MaterialInstance>,
    settings: Option<ShaderSettings>,
}

impl CompositionPass {
    pub fn new(
        device: Arc<Device>,
        pool: Arc<DescriptorPool>,
        width: u32,
        height: u32,
    ) -> RendererResult<Self> {
        let framebuffer = Self::create_framebuffer(&device, width, height)?;

        let (quad_vertices, quad_indices, quad_index_count) = Self::create_quad(&device)?;

        let mut globals = Buffer::new_uniform(
            device.clone(),
            std::mem::size_of::<GlobalsUniform>() as u64,
            "composition globals",
        )?;
        globals.write_pod(&GlobalsUniform {
            proj: Mat4::orthographic_rh(0.0, 1.0, 0.0, 1.0, -1.0, 1.0),
            model: Mat4::IDENTITY,
        });

        let lights = Buffer::new_uniform(
            device.clone(),
            std::mem::size_of::<LightsUniform>() as u64,
            "composition lights",
        )?;

        let command_buffer = CommandBuffer::new(device.clone())?;
        let semaphore = device.create_semaphore()?;

        Ok(Self {
            device,
            pool,
            framebuffer,
            command_buffer,
            semaphore,
            quad_vertices,
            quad_indices,
            quad_index_count,
            globals,
            lights,
            material: None,
            instance: None,
            settings: None,
        })
    }

    fn create_framebuffer(device: &Arc<Device>, width: u32, height: u32) -> RendererResult<FrameBuffer> {
        let depth_format = device.find_depth_format()?;
        FrameBuffer::create_owned(
            device.clone(),
            width,
            height,
            &[
                AttachmentSpec::color("colour", vk::Format::R8G8B8A8_UNORM),
                AttachmentSpec::depth("depth", depth_format),
            ],
        )
    }

    /// Fullscreen quad in the [0,1] range drawn through an orthographic
    /// projection over the same range.
    fn create_quad(device: &Arc<Device>) -> RendererResult<(Buffer, Buffer, u32)> {
        let vertices = [
            QuadVertex {
                position: [1.0, 1.0, 0.0],
                uv: [1.0, 1.0],
            },
            QuadVertex {
                position: [0.0, 1.0, 0.0],
                uv: [0.0, 1.0],
            },
            QuadVertex {
                position: [0.0, 0.0, 0.0],
                uv: [0.0, 0.0],
            },
            QuadVertex {
                position: [1.0, 0.0, 0.0],
                uv: [1.0, 0.0],
            },
        ];
        let indices: [u32; 6] = [0, 1, 2, 2, 3, 0];

        let mut vertex_buffer = Buffer::new(
            device.clone(),
            std::mem::size_of_val(&vertices) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
            "composition quad vertices",
        )?;
        vertex_buffer.write(0, bytemuck::cast_slice(&vertices));

        let mut index_buffer = Buffer::new(
            device.clone(),
            std::mem::size_of_val(&indices) as u64,
            vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryLocation::CpuToGpu,
            "composition quad indices",
        )?;
        index_buffer.write(0, bytemuck::cast_slice(&indices));

        Ok((vertex_buffer, index_buffer, indices.len() as u32))
    }

    pub fn recreate(&mut self, width: u32, height: u32, gbuffer: &FrameBuffer) -> RendererResult<()> {
        self.framebuffer = Self::create_framebuffer(&self.device, width, height)?;
        // The old instance samples views that no longer exist
        if self.instance.is_some() {
            self.bind_inputs(gbuffer, &[], &[]);
        }
        Ok(())
    }

    /// Rebuilds the composition material iff the baked light/shadow counts
    /// changed or the shadow set is out of date, then acknowledges the
    /// shadow manager. Uploads the lights uniform unconditionally.
    pub fn prepare(
        &mut self,
        gbuffer: &FrameBuffer,
        shadow_manager: &mut ShadowManager,
        lights: &[Light],
        view_position: Vec3,
    ) -> RendererResult<()> {
        self.lights
            .write_pod(&LightsUniform::from_scene(lights, view_position));

        let counts = light_counts(lights);
        let next = composition_settings(
            counts.point,
            counts.directional,
            shadow_manager.directional_count(),
            shadow_manager.omni_count(),
        );

        if !needs_rebuild(
            self.settings.as_ref(),
            &next,
            shadow_manager.shadow_textures_out_of_date(),
        ) {
            return Ok(());
        }

        log::debug!(
            "Rebuilding composition material ({} point, {} directional, {} dir shadows, {} omni shadows)",
            counts.point,
            counts.directional,
            shadow_manager.directional_count(),
            shadow_manager.omni_count()
        );

        let mut material = Material::new(
            self.device.clone(),
            self.pool.clone(),
            &next.apply(COMPOSITION_SHADER),
            self.framebuffer.render_pass(),
        );
        material.setup()?;

        self.material = Some(Arc::new(material));
        self.instance = Some(MaterialInstance::new(self.material.as_ref().unwrap().clone()));
        self.settings = Some(next);

        let dir_maps: Vec<TextureBinding> = shadow_manager
            .directional()
            .map(|shadow| shadow.shadow_map_binding())
            .collect();
        let omni_maps: Vec<TextureBinding> = shadow_manager
            .omni()
            .map(|shadow| shadow.cubemap_binding())
            .collect();
        self.bind_inputs(gbuffer, &dir_maps, &omni_maps);

        shadow_manager.set_shadow_textures_up_to_date();
        Ok(())
    }

    fn bind_inputs(
        &mut self,
        gbuffer: &FrameBuffer,
        dir_maps: &[TextureBinding],
        omni_maps: &[TextureBinding],
    ) {
        let instance = self.instance.as_mut().expect("composition material missing");
        let sampler = gbuffer.sampler().expect("owned framebuffer has a sampler");

        instance.set_buffer_uniform("globals", &self.globals);
        instance.set_buffer_uniform("lights", &self.lights);

        for name in ["position", "normal", "colour"] {
            let attachment = gbuffer
                .attachment(name)
                .expect("G-buffer attachment missing");
            let uniform = match name {
                "position" => "position_map",
                "normal" => "normal_map",
                _ => "albedo_map",
            };
            instance.set_texture_uniform(
                uniform,
                &[TextureBinding {
                    sampler,
                    view: attachment.view(),
                }],
                false,
            );
        }

        if !dir_maps.is_empty() {
            instance.set_texture_uniform("dir_shadow_maps", dir_maps, true);
        }
        if !omni_maps.is_empty() {
            instance.set_texture_uniform("omni_shadow_maps", omni_maps, false);
        }
    }

    pub fn build_command_buffer(&mut self) -> RendererResult<()> {
        self.command_buffer.begin_recording()?;
        self.command_buffer.begin_render_pass(&self.framebuffer);
        self.command_buffer.set_viewport(
            self.framebuffer.width() as f32,
            self.framebuffer.height() as f32,
        );
        self.command_buffer
            .set_scissor(self.framebuffer.width(), self.framebuffer.height());

        let mut ctx = RenderContext::new(&self.command_buffer);
        let instance = self.instance.as_mut().expect("composition material missing");
        instance.bind(&mut ctx)?;

        self.command_buffer.bind_vertex_buffer(self.quad_vertices.raw());
        self.command_buffer.bind_index_buffer(self.quad_indices.raw());
        self.command_buffer.draw_indexed(self.quad_index_count);

        self.command_buffer.end_render_pass();
        self.command_buffer.end_recording()
    }

    pub fn submit(&self, wait_semaphores: &[vk::Semaphore]) -> RendererResult<()> {
        self.command_buffer
            .submit(wait_semaphores, &[self.semaphore])
    }

    pub fn framebuffer(&self) -> &FrameBuffer {
        &self.framebuffer
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for CompositionPass {
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
    fn settings_bake_counts_with_nonzero_array_extents() {
        let settings = composition_settings(3, 1, 0, 2);
        let preamble = settings.preamble();
        assert!(preamble.contains("const NUM_POINT_LIGHTS: i32 = 3;"));
        assert!(preamble.contains("const NUM_DIR_SHADOWS: i32 = 0;"));
        // Zero-sized binding arrays are not declarable
        assert!(preamble.contains("const DIR_SHADOW_MAP_COUNT: i32 = 1;"));
        assert!(preamble.contains("const OMNI_SHADOW_MAP_COUNT: i32 = 2;"));
    }

    #[test]
    fn rebuild_only_on_count_change_or_stale_shadows() {
        let current = composition_settings(2, 1, 1, 0);

        // Same counts, shadows acknowledged: no rebuild
        assert!(!needs_rebuild(
            Some(&current),
            &composition_settings(2, 1, 1, 0),
            false
        ));

        // Changed counts force a rebuild
        assert!(needs_rebuild(
            Some(&current),
            &composition_settings(3, 1, 1, 0),
            false
        ));

        // Stale shadow set forces a rebuild even with identical counts
        assert!(needs_rebuild(
            Some(&current),
            &composition_settings(2, 1, 1, 0),
            true
        ));

        // No material yet always builds
        assert!(needs_rebuild(None, &current, false));
    }

    #[test]
    fn composition_shader_compiles_with_baked_settings() {
        let settings = composition_settings(2, 1, 1, 1);
        let spirv = crate::shader::compile_wgsl(&settings.apply(COMPOSITION_SHADER)).unwrap();
        assert!(!spirv.is_empty());
    }
}
