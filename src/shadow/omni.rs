//! Omni-directional shadow caster
//!
//! Renders the scene six times from the light position — one fixed rotation
//! per cube face, passed as a push constant — into a reused R32 capture
//! framebuffer, then copies each capture into the matching layer of a
//! cubemap with explicit layout transitions. The fragment stage stores the
//! world-space distance to the light, which the composition shader compares
//! against the receiver distance.

use crate::buffer::Buffer;
use crate::commands::{CommandBuffer, RenderContext};
use crate::descriptor::{DescriptorPool, TextureBinding};
use crate::device::Device;
use crate::error::RendererResult;
use crate::framebuffer::{AttachmentSpec, FrameBuffer};
use crate::image::{set_image_layout, Texture};
use crate::material::{Material, MaterialInstance};
use crate::scene::RenderObject;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::sync::Arc;

pub const OMNI_SHADOW_RESOLUTION: u32 = 1024;

const OMNI_SHADOW_SHADER: &str = r#"
struct OmniUbo {
    proj: mat4x4<f32>,
    light_pos: vec4<f32>,
}

struct FaceView {
    view: mat4x4<f32>,
    model: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> ubo: OmniUbo;
var<push_constant> face: FaceView;

struct VertexIn {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec3<f32>,
}

struct VertexOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
}

@vertex
fn vs_main(input: VertexIn) -> VertexOut {
    var out: VertexOut;
    let world = face.model * vec4<f32>(input.position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = ubo.proj * face.view * world;
    return out;
}

@fragment
fn fs_main(input: VertexOut) -> @location(0) f32 {
    return distance(input.world_position, ubo.light_pos.xyz);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct OmniUniform {
    proj: Mat4,
    light_pos: Vec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FacePush {
    view: Mat4,
    model: Mat4,
}

/// Fixed view rotation for one cube face.
fn face_rotation(face: u32) -> Mat4 {
    let rotation = Mat4::IDENTITY;
    match face {
        // +X
        0 => rotation
            * Mat4::from_rotation_y(90f32.to_radians())
            * Mat4::from_rotation_x(180f32.to_radians()),
        // -X
        1 => rotation
            * Mat4::from_rotation_y(-90f32.to_radians())
            * Mat4::from_rotation_x(180f32.to_radians()),
        // +Y
        2 => rotation * Mat4::from_rotation_x(-90f32.to_radians()),
        // -Y
        3 => rotation * Mat4::from_rotation_x(90f32.to_radians()),
        // +Z
        4 => rotation * Mat4::from_rotation_x(180f32.to_radians()),
        // -Z
        _ => rotation * Mat4::from_rotation_z(180f32.to_radians()),
    }
}

pub struct OmniShadow {
    device: Arc<Device>,
    framebuffer: FrameBuffer,
    command_buffer: CommandBuffer,
    semaphore: vk::Semaphore,
    material: Arc<Material>,
    instance: MaterialInstance,
    uniform: Buffer,
    cubemap: Texture,
    position: Vec3,
}

impl OmniShadow {
    pub fn new(device: Arc<Device>, pool: Arc<DescriptorPool>, position: Vec3) -> RendererResult<Self> {
        let depth_format = device.find_depth_format()?;
        let framebuffer = FrameBuffer::create_owned(
            device.clone(),
            OMNI_SHADOW_RESOLUTION,
            OMNI_SHADOW_RESOLUTION,
            &[
                AttachmentSpec::color("dist", vk::Format::R32_SFLOAT),
                AttachmentSpec::depth("depth", depth_format),
            ],
        )?;

        let mut material = Material::new(
            device.clone(),
            pool,
            OMNI_SHADOW_SHADER,
            framebuffer.render_pass(),
        );
        material.set_cull_mode(vk::CullModeFlags::BACK);
        material.setup()?;
        let material = Arc::new(material);

        let uniform = Buffer::new_uniform(
            device.clone(),
            std::mem::size_of::<OmniUniform>() as u64,
            "omni shadow ubo",
        )?;

        let mut instance = MaterialInstance::new(material.clone());
        instance.set_buffer_uniform("ubo", &uniform);

        let cubemap = Texture::new_cubemap(
            device.clone(),
            OMNI_SHADOW_RESOLUTION,
            vk::Format::R32_SFLOAT,
            "omni shadow cubemap",
        )?;

        let command_buffer = CommandBuffer::new(device.clone())?;
        let semaphore = device.create_semaphore()?;

        let mut shadow = Self {
            device,
            framebuffer,
            command_buffer,
            semaphore,
            material,
            instance,
            uniform,
            cubemap,
            position,
        };
        shadow.update(position);
        Ok(shadow)
    }

    /// Uploads the projection and current light position.
    pub fn update(&mut self, position: Vec3) {
        self.position = position;
        self.uniform.write_pod(&OmniUniform {
            proj: Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.01, 1024.0),
            light_pos: position.extend(1.0),
        });
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Re-records all six faces against the frame's renderable snapshot.
    pub fn build_command_buffer(&mut self, objects: &mut [RenderObject]) -> RendererResult<()> {
        self.command_buffer.begin_recording()?;

        let translation = Mat4::from_translation(-self.position);
        let extent = self.framebuffer.width();

        let mut ctx = RenderContext::new(&self.command_buffer);

        for face in 0..6u32 {
            self.command_buffer.begin_render_pass(&self.framebuffer);
            self.command_buffer.set_viewport(extent as f32, extent as f32);
            self.command_buffer.set_scissor(extent, extent);

            for object in objects.iter_mut() {
                let push = FacePush {
                    view: face_rotation(face) * translation,
                    model: object.model,
                };
                self.command_buffer.push_constants(
                    self.material.pipeline_layout(),
                    vk::ShaderStageFlags::VERTEX,
                    bytemuck::bytes_of(&push),
                );

                for surface in &mut object.surfaces {
                    surface.render(&mut ctx, Some(&mut self.instance))?;
                }
            }

            self.command_buffer.end_render_pass();
            self.copy_capture_to_face(face);
        }

        self.command_buffer.end_recording()
    }

    /// Copies the capture attachment into one cubemap layer, transitioning
    /// capture (shader-read → transfer-src → shader-read) and the face
    /// (shader-read → transfer-dst → shader-read) around the copy.
    fn copy_capture_to_face(&self, face: u32) {
        let capture = self
            .framebuffer
            .attachment("dist")
            .expect("omni capture framebuffer has a dist attachment");

        let capture_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let face_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: face,
            layer_count: 1,
        };

        let cmd = self.command_buffer.raw();

        set_image_layout(
            &self.device,
            cmd,
            capture.image(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            capture_range,
        );
        set_image_layout(
            &self.device,
            cmd,
            self.cubemap.image(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            face_range,
        );

        let copy_region = vk::ImageCopy {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offset: vk::Offset3D::default(),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: face,
                layer_count: 1,
            },
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: OMNI_SHADOW_RESOLUTION,
                height: OMNI_SHADOW_RESOLUTION,
                depth: 1,
            },
        };

        unsafe {
            self.device.raw().cmd_copy_image(
                cmd,
                capture.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.cubemap.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region],
            );
        }

        set_image_layout(
            &self.device,
            cmd,
            capture.image(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            capture_range,
        );
        set_image_layout(
            &self.device,
            cmd,
            self.cubemap.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            face_range,
        );
    }

    pub fn submit(&self, wait_semaphores: &[vk::Semaphore]) -> RendererResult<()> {
        self.command_buffer
            .submit(wait_semaphores, &[self.semaphore])
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Sampler + cube view for the composition pass.
    pub fn cubemap_binding(&self) -> TextureBinding {
        TextureBinding {
            sampler: self.cubemap.sampler(),
            view: self.cubemap.view(),
        }
    }
}

impl Drop for OmniShadow {
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
    fn face_rotations_are_distinct() {
        let mut seen = Vec::new();
        for face in 0..6 {
            let rotation = face_rotation(face);
            assert!(
                !seen.iter().any(|m: &Mat4| m.abs_diff_eq(rotation, 1e-6)),
                "face {} repeats a rotation",
                face
            );
            seen.push(rotation);
        }
    }

    #[test]
    fn face_views_translate_to_light_position() {
        let position = Vec3::new(3.0, -2.0, 5.0);
        let view = face_rotation(4) * Mat4::from_translation(-position);
        // The light position maps to the view-space origin
        let at_light = view * position.extend(1.0);
        assert!(at_light.truncate().abs_diff_eq(Vec3::ZERO, 1e-4));
    }
}
