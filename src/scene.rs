//! Renderable snapshot and light types
//!
//! The scene graph lives outside this crate. Each frame the caller hands the
//! orchestrator a flat snapshot: renderable objects (stable id + model
//! matrix + surfaces over pre-uploaded mesh buffers) and the active light
//! list. Shadow casters key their per-object caches on [`RenderableId`],
//! which stays stable for the lifetime of the renderable.

use crate::commands::RenderContext;
use crate::error::RendererResult;
use crate::material::{Material, MaterialInstance};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::sync::Arc;

pub const MAX_POINT_LIGHTS: usize = 16;
pub const MAX_DIRECTIONAL_LIGHTS: usize = 4;

/// Stable identity of a renderable, assigned by the scene layer and reused
/// for cache keys until the renderable is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderableId(pub u64);

/// Opaque, pre-uploaded geometry from the asset pipeline.
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub vertex: vk::Buffer,
    pub index: vk::Buffer,
    pub index_count: u32,
}

/// One drawable sub-mesh bound to a material instance.
pub struct Surface {
    mesh: MeshBuffers,
    material_instance: MaterialInstance,
}

impl Surface {
    pub fn new(mesh: MeshBuffers, material: Arc<Material>) -> Self {
        Self {
            mesh,
            material_instance: MaterialInstance::new(material),
        }
    }

    /// Replaces the surface's material instance wholesale.
    pub fn set_material(&mut self, material: Arc<Material>) {
        self.material_instance = MaterialInstance::new(material);
    }

    pub fn mesh(&self) -> &MeshBuffers {
        &self.mesh
    }

    pub fn material_instance_mut(&mut self) -> &mut MaterialInstance {
        &mut self.material_instance
    }

    /// Per-object draw entry point: binds the (possibly overridden)
    /// material instance, then geometry, then draws.
    pub fn render(
        &mut self,
        ctx: &mut RenderContext,
        override_instance: Option<&mut MaterialInstance>,
    ) -> RendererResult<()> {
        let instance = match override_instance {
            Some(instance) => instance,
            None => &mut self.material_instance,
        };
        instance.bind(ctx)?;

        ctx.cmd().bind_vertex_buffer(self.mesh.vertex);
        ctx.cmd().bind_index_buffer(self.mesh.index);
        ctx.cmd().draw_indexed(self.mesh.index_count);
        Ok(())
    }
}

/// One renderable in the per-frame snapshot.
pub struct RenderObject {
    pub id: RenderableId,
    pub model: Mat4,
    pub surfaces: Vec<Surface>,
}

#[derive(Debug, Clone, Copy)]
pub struct PointLight {
    pub position: Vec3,
    pub colour: Vec3,
    pub radius: f32,
    pub casts_shadows: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub colour: Vec3,
    pub casts_shadows: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Light {
    Point(PointLight),
    Directional(DirectionalLight),
}

/// Active light totals, used to bake composition shader constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightCounts {
    pub point: usize,
    pub directional: usize,
}

pub fn light_counts(lights: &[Light]) -> LightCounts {
    let mut counts = LightCounts::default();
    for light in lights {
        match light {
            Light::Point(_) => counts.point += 1,
            Light::Directional(_) => counts.directional += 1,
        }
    }
    counts
}

/// GPU layout for one point light: position.w carries the radius.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuPointLight {
    pub position: Vec4,
    pub colour: Vec4,
}

/// GPU layout for one directional light. `view_proj` is the light's shadow
/// projection, matching the matrix the directional shadow pass renders
/// with.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    pub direction: Vec4,
    pub colour: Vec4,
    pub view_proj: Mat4,
}

/// Fixed-capacity lights uniform block; baked shader constants bound the
/// loops, the array extents stay static.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightsUniform {
    pub point_lights: [GpuPointLight; MAX_POINT_LIGHTS],
    pub directional_lights: [GpuDirectionalLight; MAX_DIRECTIONAL_LIGHTS],
    pub view_position: Vec4,
}

impl LightsUniform {
    pub fn from_scene(lights: &[Light], view_position: Vec3) -> Self {
        let mut uniform = Self::zeroed();
        let mut point_index = 0;
        let mut dir_index = 0;

        for light in lights {
            match light {
                Light::Point(point) => {
                    if point_index >= MAX_POINT_LIGHTS {
                        log::warn!("Point light count exceeds {}", MAX_POINT_LIGHTS);
                        continue;
                    }
                    uniform.point_lights[point_index] = GpuPointLight {
                        position: point.position.extend(point.radius),
                        colour: point.colour.extend(0.0),
                    };
                    point_index += 1;
                }
                Light::Directional(dir) => {
                    if dir_index >= MAX_DIRECTIONAL_LIGHTS {
                        log::warn!(
                            "Directional light count exceeds {}",
                            MAX_DIRECTIONAL_LIGHTS
                        );
                        continue;
                    }
                    uniform.directional_lights[dir_index] = GpuDirectionalLight {
                        direction: dir.direction.extend(0.0),
                        colour: dir.colour.extend(0.0),
                        view_proj: crate::shadow::light_view_proj(dir.direction),
                    };
                    dir_index += 1;
                }
            }
        }

        uniform.view_position = view_position.extend(0.0);
        uniform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_lights_by_kind() {
        let lights = vec![
            Light::Point(PointLight {
                position: Vec3::ZERO,
                colour: Vec3::ONE,
                radius: 10.0,
                casts_shadows: true,
            }),
            Light::Point(PointLight {
                position: Vec3::X,
                colour: Vec3::ONE,
                radius: 5.0,
                casts_shadows: false,
            }),
            Light::Directional(DirectionalLight {
                direction: -Vec3::Y,
                colour: Vec3::ONE,
                casts_shadows: true,
            }),
        ];

        let counts = light_counts(&lights);
        assert_eq!(counts.point, 2);
        assert_eq!(counts.directional, 1);
    }

    #[test]
    fn point_light_radius_packs_into_position_w() {
        let lights = vec![Light::Point(PointLight {
            position: Vec3::new(1.0, 2.0, 3.0),
            colour: Vec3::ONE,
            radius: 25.0,
            casts_shadows: false,
        })];

        let uniform = LightsUniform::from_scene(&lights, Vec3::ZERO);
        assert_eq!(uniform.point_lights[0].position.w, 25.0);
        assert_eq!(uniform.point_lights[0].position.truncate(), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn lights_uniform_is_densely_packed_vec4s() {
        // std140-compatible: every field is a vec4 multiple
        assert_eq!(
            std::mem::size_of::<LightsUniform>(),
            32 * MAX_POINT_LIGHTS + 96 * MAX_DIRECTIONAL_LIGHTS + 16
        );
    }
}
