//! Shadow casting subsystem: per-light shadow-map production and the
//! registry that tracks shadow topology for the composition pass.

mod directional;
mod manager;
mod omni;

pub use directional::{light_view_proj, DirectionalShadow};
pub use manager::{ShadowId, ShadowManager};
pub use omni::{OmniShadow, OMNI_SHADOW_RESOLUTION};
