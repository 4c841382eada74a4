//! G-buffer pass
//!
//! Renders every surface of the frame snapshot with its own material
//! instance into the position/normal/albedo targets plus depth. Per-object
//! uniforms (model/view/projection) are owned and updated by the scene
//! layer; this pass only records binds and draws.

use crate::commands::{CommandBuffer, RenderContext};
use crate::device::Device;
use crate::error::RendererResult;
use crate::framebuffer::{AttachmentSpec, FrameBuffer};
use crate::scene::RenderObject;
use ash::vk;
use std::sync::Arc;

/// G-buffer generation shader. Scene materials targeting this pass are
/// created from this source with the pass's render pass.
pub const GBUFFER_SHADER: &str = r#"
struct ObjectUbo {
    proj: mat4x4<f32>,
    view: mat4x4<f32>,
    model: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> ubo: ObjectUbo;
@group(0) @binding(1) var colour_map: texture_2d<f32>;
@group(0) @binding(2) var colour_sampler: sampler;
@group(0) @binding(3) var normal_map: texture_2d<f32>;
@group(0) @binding(4) var normal_sampler: sampler;

struct VertexIn {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec3<f32>,
}

struct VertexOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) world_tangent: vec3<f32>,
    @location(3) uv: vec2<f32>,
}

struct GBufferOut {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) colour: vec4<f32>,
}

@vertex
fn vs_main(input: VertexIn) -> VertexOut {
    var out: VertexOut;
    let world = ubo.model * vec4<f32>(input.position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = ubo.proj * ubo.view * world;
    out.world_normal = normalize((ubo.model * vec4<f32>(input.normal, 0.0)).xyz);
    out.world_tangent = normalize((ubo.model * vec4<f32>(input.tangent, 0.0)).xyz);
    out.uv = input.uv;
    return out;
}

@fragment
fn fs_main(input: VertexOut) -> GBufferOut {
    var out: GBufferOut;
    out.position = vec4<f32>(input.world_position, 1.0);

    let bitangent = cross(input.world_normal, input.world_tangent);
    let tbn = mat3x3<f32>(input.world_tangent, bitangent, input.world_normal);
    let sampled = textureSample(normal_map, normal_sampler, input.uv).xyz * 2.0 - 1.0;
    out.normal = vec4<f32>(normalize(tbn * sampled), 0.0);

    out.colour = textureSample(colour_map, colour_sampler, input.uv);
    return out;
}
"#;

pub struct GeometryPass {
    device: Arc<Device>,
    framebuffer: FrameBuffer,
    command_buffer: CommandBuffer,
    semaphore: vk::Semaphore,
}

impl GeometryPass {
    pub fn new(device: Arc<Device>, width: u32, height: u32) -> RendererResult<Self> {
        let framebuffer = Self::create_framebuffer(&device, width, height)?;
        let command_buffer = CommandBuffer::new(device.clone())?;
        let semaphore = device.create_semaphore()?;

        Ok(Self {
            device,
            framebuffer,
            command_buffer,
            semaphore,
        })
    }

    fn create_framebuffer(device: &Arc<Device>, width: u32, height: u32) -> RendererResult<FrameBuffer> {
        let depth_format = device.find_depth_format()?;
        FrameBuffer::create_owned(
            device.clone(),
            width,
            height,
            &[
                AttachmentSpec::color("position", vk::Format::R16G16B16A16_SFLOAT),
                AttachmentSpec::color("normal", vk::Format::R16G16B16A16_SFLOAT),
                AttachmentSpec::color("colour", vk::Format::R8G8B8A8_UNORM),
                AttachmentSpec::depth("depth", depth_format),
            ],
        )
    }

    /// Recreated wholesale on resize; the replacement render pass is
    /// compatible with pipelines built against the old one.
    pub fn recreate(&mut self, width: u32, height: u32) -> RendererResult<()> {
        self.framebuffer = Self::create_framebuffer(&self.device, width, height)?;
        Ok(())
    }

    pub fn build_command_buffer(&mut self, objects: &mut [RenderObject]) -> RendererResult<()> {
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
            for surface in &mut object.surfaces {
                surface.render(&mut ctx, None)?;
            }
        }

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

    pub fn render_pass(&self) -> vk::RenderPass {
        self.framebuffer.render_pass()
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for GeometryPass {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_semaphore(self.semaphore, None);
        }
    }
}
