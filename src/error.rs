//! Renderer error type
//!
//! Every fatal condition (failed device init, resource creation, submission)
//! surfaces as a [`RendererError`] and propagates to the caller; there is no
//! partial-GPU-state recovery path. Swapchain invalidation is the one
//! expected, recoverable condition and gets its own variant.

use thiserror::Error;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to initialize renderer: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to compile shader: {0}")]
    ShaderCompilationFailed(String),
    #[error("Failed to reflect shader: {0}")]
    ShaderReflectionFailed(String),
    #[error("Descriptor pool exhausted: {0}")]
    DescriptorPoolExhausted(String),
    #[error("Failed to record commands: {0}")]
    CommandRecordingFailed(String),
    #[error("Failed to submit commands: {0}")]
    SubmissionFailed(String),
    /// The swapchain no longer matches the surface; the frame was skipped
    /// and the swapchain must be recreated before the next one.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,
}

pub type RendererResult<T> = Result<T, RendererError>;
