//! Ashen — a deferred-shading Vulkan render core
//!
//! The crate drives one frame of a deferred pipeline with dynamic shadow
//! casters on top of ash:
//! - shadow passes (directional maps, omni-directional cubemaps)
//! - G-buffer generation (position, normal, albedo)
//! - a fullscreen composition pass with baked light/shadow counts
//! - an external overlay hook and the present-target blit
//!
//! Every binding layout, vertex layout and blend-attachment count is
//! recovered from compiled shader reflection; nothing downstream of
//! [`reflect`] hand-authors a layout. The scene graph, asset import and
//! windowing live outside the crate and talk to it through the snapshot
//! types in [`scene`].

pub mod buffer;
pub mod commands;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod image;
pub mod material;
pub mod passes;
pub mod pipeline;
pub mod reflect;
pub mod scene;
pub mod shader;
pub mod shadow;
pub mod swapchain;

pub use buffer::Buffer;
pub use commands::{CommandBuffer, RenderContext};
pub use descriptor::{DescriptorPool, DescriptorSet, DescriptorSetLayout, TextureBinding};
pub use device::Device;
pub use error::{RendererError, RendererResult};
pub use frame::{FrameOrchestrator, FrameStatus, RendererConfig, SceneFrame};
pub use framebuffer::{Attachment, AttachmentSpec, FrameBuffer};
pub use material::{Material, MaterialInstance};
pub use passes::{OverlayHook, GBUFFER_SHADER};
pub use reflect::{
    BindingSet, DescriptorBinding, DescriptorBindingKind, ShaderReflection, VertexLayout,
};
pub use scene::{
    DirectionalLight, Light, MeshBuffers, PointLight, RenderObject, RenderableId, Surface,
};
pub use shader::{compile_wgsl, ShaderSettings};
pub use shadow::{DirectionalShadow, OmniShadow, ShadowId, ShadowManager};
