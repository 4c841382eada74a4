//! Frame passes: G-buffer generation, deferred composition, the external
//! overlay hook and the present-target blit.

mod composition;
mod geometry;
mod overlay;
mod present;

pub use composition::CompositionPass;
pub use geometry::{GeometryPass, GBUFFER_SHADER};
pub use overlay::{OverlayHook, OverlayPass};
pub use present::PresentPass;
