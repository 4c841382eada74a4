//! Shader reflection
//!
//! All binding layouts, vertex input layouts, push-constant ranges and
//! blend-attachment counts in this crate are recovered from compiled SPIR-V
//! through naga's IR — nothing downstream hand-authors a layout. Reflection
//! runs once per shader stage and produces a typed [`ShaderReflection`]
//! value that is passed into descriptor-layout and pipeline construction.
//!
//! Texture bindings follow the combined-image-sampler model: each sampled
//! image global becomes one combined binding at the image's slot, and plain
//! sampler globals pair with their image rather than surfacing as separate
//! bindings.

use crate::error::{RendererError, RendererResult};
use ash::vk;
use naga::{AddressSpace, Binding, ScalarKind, TypeInner};

/// Kind of a reflected descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorBindingKind {
    UniformBuffer,
    CombinedImageSampler,
}

/// One reflected descriptor-set binding.
#[derive(Debug, Clone)]
pub struct DescriptorBinding {
    pub kind: DescriptorBindingKind,
    pub stage: vk::ShaderStageFlags,
    pub slot: u32,
    pub count: u32,
    pub name: String,
}

/// A reflected array count of 0 (unsized or scalar declarations) binds as a
/// single descriptor.
pub(crate) fn normalized_count(raw: u32) -> u32 {
    raw.max(1)
}

/// The merged, slot-ordered set of bindings for one or more stages.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    bindings: Vec<DescriptorBinding>,
}

impl BindingSet {
    fn push(&mut self, binding: DescriptorBinding) {
        self.bindings.push(binding);
        self.bindings.sort_by_key(|b| b.slot);
    }

    /// Merges another stage's bindings. A slot present in both stages keeps
    /// one entry with the stage flags combined.
    pub fn merge(&self, other: &BindingSet) -> BindingSet {
        let mut merged = self.clone();
        for binding in &other.bindings {
            if let Some(existing) = merged.bindings.iter_mut().find(|b| b.slot == binding.slot) {
                existing.stage |= binding.stage;
            } else {
                merged.bindings.push(binding.clone());
            }
        }
        merged.bindings.sort_by_key(|b| b.slot);
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = &DescriptorBinding> {
        self.bindings.iter()
    }

    pub fn get(&self, name: &str) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// One vertex stage input.
#[derive(Debug, Clone)]
pub struct VertexInput {
    pub location: u32,
    pub format: vk::Format,
    pub size: u32,
    pub offset: u32,
    pub name: String,
}

/// Vertex input layout: inputs sorted ascending by location, offsets
/// assigned cumulatively in that order.
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    pub inputs: Vec<VertexInput>,
    pub stride: u32,
}

impl VertexLayout {
    fn new(mut inputs: Vec<VertexInput>) -> Self {
        inputs.sort_by_key(|i| i.location);
        let mut offset = 0;
        for input in &mut inputs {
            input.offset = offset;
            offset += input.size;
        }
        Self {
            inputs,
            stride: offset,
        }
    }
}

/// Reflected push-constant range for one stage.
#[derive(Debug, Clone)]
pub struct PushConstantRange {
    pub stage: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Everything the pipeline layer needs to know about one compiled stage.
#[derive(Debug, Clone)]
pub struct ShaderReflection {
    pub stage: vk::ShaderStageFlags,
    pub bindings: BindingSet,
    pub push_constants: Vec<PushConstantRange>,
    /// Present for the vertex stage only.
    pub vertex_layout: Option<VertexLayout>,
    /// Sizes the blend-attachment array; non-zero for the fragment stage.
    pub fragment_output_count: u32,
}

impl ShaderReflection {
    pub fn from_spirv(spirv: &[u32], stage: vk::ShaderStageFlags) -> RendererResult<Self> {
        let options = naga::front::spv::Options::default();
        let module = naga::front::spv::parse_u8_slice(bytemuck::cast_slice(spirv), &options)
            .map_err(|e| RendererError::ShaderReflectionFailed(e.to_string()))?;
        Self::from_module(&module, stage)
    }

    pub fn from_module(module: &naga::Module, stage: vk::ShaderStageFlags) -> RendererResult<Self> {
        let naga_stage = if stage == vk::ShaderStageFlags::VERTEX {
            naga::ShaderStage::Vertex
        } else if stage == vk::ShaderStageFlags::FRAGMENT {
            naga::ShaderStage::Fragment
        } else {
            return Err(RendererError::ShaderReflectionFailed(format!(
                "Unsupported shader stage {:?}",
                stage
            )));
        };

        let entry_point = module
            .entry_points
            .iter()
            .find(|ep| ep.stage == naga_stage)
            .ok_or_else(|| {
                RendererError::ShaderReflectionFailed(format!(
                    "No {:?} entry point in module",
                    naga_stage
                ))
            })?;

        let mut bindings = BindingSet::default();
        let mut push_constants = Vec::new();

        for (_, var) in module.global_variables.iter() {
            let name = var.name.clone().unwrap_or_default();
            let inner = &module.types[var.ty].inner;

            match var.space {
                AddressSpace::Uniform => {
                    let Some(resource) = &var.binding else {
                        continue;
                    };
                    bindings.push(DescriptorBinding {
                        kind: DescriptorBindingKind::UniformBuffer,
                        stage,
                        slot: resource.binding,
                        count: normalized_count(1),
                        name,
                    });
                }
                AddressSpace::Handle => {
                    let Some(resource) = &var.binding else {
                        continue;
                    };
                    match inner {
                        TypeInner::Image { .. } => {
                            bindings.push(DescriptorBinding {
                                kind: DescriptorBindingKind::CombinedImageSampler,
                                stage,
                                slot: resource.binding,
                                count: normalized_count(1),
                                name,
                            });
                        }
                        TypeInner::BindingArray { base, size } => {
                            let raw_count = match size {
                                naga::ArraySize::Constant(n) => n.get(),
                                naga::ArraySize::Dynamic => 0,
                            };
                            match module.types[*base].inner {
                                TypeInner::Image { .. } => {
                                    bindings.push(DescriptorBinding {
                                        kind: DescriptorBindingKind::CombinedImageSampler,
                                        stage,
                                        slot: resource.binding,
                                        count: normalized_count(raw_count),
                                        name,
                                    });
                                }
                                _ => {
                                    log::warn!(
                                        "Unrecognized binding array element for '{}', no binding assigned",
                                        name
                                    );
                                }
                            }
                        }
                        // Samplers fold into their image's combined binding
                        TypeInner::Sampler { .. } => {}
                        _ => {
                            log::warn!(
                                "Unrecognized handle binding type for '{}', no binding assigned",
                                name
                            );
                        }
                    }
                }
                AddressSpace::PushConstant => {
                    push_constants.push(PushConstantRange {
                        stage,
                        offset: 0,
                        size: inner.size(module.to_ctx()),
                    });
                }
                _ => {}
            }
        }

        let vertex_layout = if naga_stage == naga::ShaderStage::Vertex {
            Some(Self::reflect_vertex_inputs(module, entry_point))
        } else {
            None
        };

        let fragment_output_count = if naga_stage == naga::ShaderStage::Fragment {
            Self::count_fragment_outputs(module, entry_point)
        } else {
            0
        };

        Ok(Self {
            stage,
            bindings,
            push_constants,
            vertex_layout,
            fragment_output_count,
        })
    }

    fn reflect_vertex_inputs(module: &naga::Module, entry_point: &naga::EntryPoint) -> VertexLayout {
        let mut inputs = Vec::new();

        for arg in &entry_point.function.arguments {
            match &arg.binding {
                Some(Binding::Location { location, .. }) => {
                    let name = arg.name.clone().unwrap_or_default();
                    Self::push_vertex_input(module, arg.ty, *location, name, &mut inputs);
                }
                Some(Binding::BuiltIn(_)) => {}
                None => {
                    // Struct argument: inputs live on the members
                    if let TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                        for member in members {
                            if let Some(Binding::Location { location, .. }) = &member.binding {
                                let name = member.name.clone().unwrap_or_default();
                                Self::push_vertex_input(
                                    module, member.ty, *location, name, &mut inputs,
                                );
                            }
                        }
                    }
                }
            }
        }

        VertexLayout::new(inputs)
    }

    fn push_vertex_input(
        module: &naga::Module,
        ty: naga::Handle<naga::Type>,
        location: u32,
        name: String,
        inputs: &mut Vec<VertexInput>,
    ) {
        match vertex_format(&module.types[ty].inner) {
            Some((format, size)) => inputs.push(VertexInput {
                location,
                format,
                size,
                offset: 0,
                name,
            }),
            None => {
                log::warn!(
                    "Unrecognized vertex input type for '{}' (location {}), no format assigned",
                    name,
                    location
                );
            }
        }
    }

    fn count_fragment_outputs(module: &naga::Module, entry_point: &naga::EntryPoint) -> u32 {
        let Some(ref result) = entry_point.function.result else {
            return 0;
        };

        match result.binding {
            Some(Binding::Location { .. }) => 1,
            Some(Binding::BuiltIn(_)) => 0,
            None => match &module.types[result.ty].inner {
                TypeInner::Struct { members, .. } => members
                    .iter()
                    .filter(|m| matches!(m.binding, Some(Binding::Location { .. })))
                    .count() as u32,
                _ => 0,
            },
        }
    }
}

/// Maps a scalar/vector stage-input type to a Vulkan vertex format and its
/// size in bytes. Returns `None` for types with no assignable format.
fn vertex_format(inner: &TypeInner) -> Option<(vk::Format, u32)> {
    match *inner {
        TypeInner::Scalar(scalar) => scalar_vertex_format(scalar.kind, scalar.width, 1),
        TypeInner::Vector { size, scalar } => {
            scalar_vertex_format(scalar.kind, scalar.width, size as u32)
        }
        _ => None,
    }
}

fn scalar_vertex_format(kind: ScalarKind, width: u8, components: u32) -> Option<(vk::Format, u32)> {
    if width != 4 {
        return None;
    }
    let format = match (kind, components) {
        (ScalarKind::Float, 1) => vk::Format::R32_SFLOAT,
        (ScalarKind::Float, 2) => vk::Format::R32G32_SFLOAT,
        (ScalarKind::Float, 3) => vk::Format::R32G32B32_SFLOAT,
        (ScalarKind::Float, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (ScalarKind::Sint, 1) => vk::Format::R32_SINT,
        (ScalarKind::Sint, 2) => vk::Format::R32G32_SINT,
        (ScalarKind::Sint, 3) => vk::Format::R32G32B32_SINT,
        (ScalarKind::Sint, 4) => vk::Format::R32G32B32A32_SINT,
        (ScalarKind::Uint, 1) => vk::Format::R32_UINT,
        (ScalarKind::Uint, 2) => vk::Format::R32G32_UINT,
        (ScalarKind::Uint, 3) => vk::Format::R32G32B32_UINT,
        (ScalarKind::Uint, 4) => vk::Format::R32G32B32A32_UINT,
        _ => return None,
    };
    Some((format, 4 * components))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::compile_wgsl;

    const TEST_SHADER: &str = r#"
struct Globals {
    view_proj: mat4x4<f32>,
    model: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var albedo_map: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;

struct VertexIn {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

struct FragmentOut {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) colour: vec4<f32>,
}

@vertex
fn vs_main(input: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip_position = globals.view_proj * globals.model * vec4<f32>(input.position, 1.0);
    out.normal = input.normal;
    out.uv = input.uv;
    return out;
}

@fragment
fn fs_main(input: VertexOut) -> FragmentOut {
    var out: FragmentOut;
    out.position = vec4<f32>(0.0);
    out.normal = vec4<f32>(input.normal, 0.0);
    out.colour = textureSample(albedo_map, albedo_sampler, input.uv);
    return out;
}
"#;

    #[test]
    fn reflects_vertex_layout_sorted_with_cumulative_offsets() {
        let spirv = compile_wgsl(TEST_SHADER).unwrap();
        let reflection =
            ShaderReflection::from_spirv(&spirv, vk::ShaderStageFlags::VERTEX).unwrap();

        let layout = reflection.vertex_layout.expect("vertex layout");
        let locations: Vec<u32> = layout.inputs.iter().map(|i| i.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);

        assert_eq!(layout.inputs[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(layout.inputs[0].offset, 0);
        assert_eq!(layout.inputs[1].offset, 12);
        assert_eq!(layout.inputs[2].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(layout.inputs[2].offset, 24);
        assert_eq!(layout.stride, 32);
    }

    #[test]
    fn reflects_uniform_and_combined_sampler_bindings() {
        let spirv = compile_wgsl(TEST_SHADER).unwrap();
        let reflection =
            ShaderReflection::from_spirv(&spirv, vk::ShaderStageFlags::FRAGMENT).unwrap();

        let buffer = reflection
            .bindings
            .iter()
            .find(|b| b.kind == DescriptorBindingKind::UniformBuffer)
            .expect("uniform buffer binding");
        assert_eq!(buffer.slot, 0);
        assert_eq!(buffer.count, 1);

        let sampler = reflection
            .bindings
            .iter()
            .find(|b| b.kind == DescriptorBindingKind::CombinedImageSampler)
            .expect("combined image sampler binding");
        assert_eq!(sampler.slot, 1);

        // The plain sampler global folds into the image binding
        assert!(reflection.bindings.iter().all(|b| b.slot != 2));
    }

    #[test]
    fn counts_fragment_outputs() {
        let spirv = compile_wgsl(TEST_SHADER).unwrap();
        let reflection =
            ShaderReflection::from_spirv(&spirv, vk::ShaderStageFlags::FRAGMENT).unwrap();
        assert_eq!(reflection.fragment_output_count, 3);
    }

    #[test]
    fn zero_array_count_normalizes_to_one() {
        assert_eq!(normalized_count(0), 1);
        assert_eq!(normalized_count(1), 1);
        assert_eq!(normalized_count(6), 6);
    }

    #[test]
    fn merge_combines_stages_on_shared_slots() {
        let spirv = compile_wgsl(TEST_SHADER).unwrap();
        let vert = ShaderReflection::from_spirv(&spirv, vk::ShaderStageFlags::VERTEX).unwrap();
        let frag = ShaderReflection::from_spirv(&spirv, vk::ShaderStageFlags::FRAGMENT).unwrap();

        let merged = vert.bindings.merge(&frag.bindings);
        let globals = merged.iter().find(|b| b.slot == 0).unwrap();
        assert!(globals.stage.contains(vk::ShaderStageFlags::VERTEX));
        assert!(globals.stage.contains(vk::ShaderStageFlags::FRAGMENT));

        // Slots stay unique and sorted after the merge
        let slots: Vec<u32> = merged.iter().map(|b| b.slot).collect();
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(slots, sorted);
    }
}
