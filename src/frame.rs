//! Frame orchestration
//!
//! One [`FrameOrchestrator::draw_frame`] call runs the whole pipeline:
//! acquire, shadow passes, G-buffer, composition, overlay, present-target,
//! present. Passes that touch neither the swapchain image nor each other
//! (shadow casters, G-buffer) are submitted without waits and join at the
//! composition pass; only the present-target submission waits on the
//! acquire semaphore. The frame ends with a present-queue idle wait, since
//! every pass re-records its single command buffer next frame.

use crate::descriptor::DescriptorPool;
use crate::device::Device;
use crate::error::{RendererError, RendererResult};
use crate::passes::{CompositionPass, GeometryPass, OverlayHook, OverlayPass, PresentPass};
use crate::scene::{DirectionalLight, Light, RenderObject, RenderableId};
use crate::shadow::{DirectionalShadow, OmniShadow, ShadowId, ShadowManager};
use crate::swapchain::Swapchain;
use ash::vk;
use glam::Vec3;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Descriptor pool capacity: uniform buffers, combined image samplers,
    /// sets. Allocated once; exhaustion is fatal.
    pub pool_uniform_buffers: u32,
    pub pool_image_samplers: u32,
    pub pool_max_sets: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            pool_uniform_buffers: 512,
            pool_image_samplers: 512,
            pool_max_sets: 256,
        }
    }
}

/// The per-frame scene snapshot handed in by the caller.
pub struct SceneFrame<'a> {
    pub objects: &'a mut [RenderObject],
    pub lights: &'a [Light],
    pub view_position: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Acquire reported the swapchain out of date: nothing was recorded or
    /// submitted, the swapchain was rebuilt.
    SwapchainRebuilt,
}

/// One planned queue submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassKind {
    DirectionalShadow(usize),
    OmniShadow(usize),
    GBuffer,
    Composition,
    Overlay,
    PresentTarget,
}

/// What a submission waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOn {
    Acquire,
    DirectionalShadow(usize),
    OmniShadow(usize),
    GBuffer,
    Composition,
    Overlay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub pass: PassKind,
    pub waits: Vec<WaitOn>,
}

/// The transient semaphore plan for one frame: shadow and G-buffer passes
/// fan out with no waits, composition joins them all, the present-target
/// pass joins the acquire semaphore. An unacquired frame submits nothing.
pub fn plan_frame(
    acquired: bool,
    directional_shadows: usize,
    omni_shadows: usize,
    overlay_enabled: bool,
) -> Vec<Submission> {
    if !acquired {
        return Vec::new();
    }

    let mut plan = Vec::new();
    let mut join = Vec::new();

    for i in 0..directional_shadows {
        plan.push(Submission {
            pass: PassKind::DirectionalShadow(i),
            waits: Vec::new(),
        });
        join.push(WaitOn::DirectionalShadow(i));
    }
    for i in 0..omni_shadows {
        plan.push(Submission {
            pass: PassKind::OmniShadow(i),
            waits: Vec::new(),
        });
        join.push(WaitOn::OmniShadow(i));
    }

    plan.push(Submission {
        pass: PassKind::GBuffer,
        waits: Vec::new(),
    });
    join.push(WaitOn::GBuffer);

    plan.push(Submission {
        pass: PassKind::Composition,
        waits: join,
    });

    let mut tail = WaitOn::Composition;
    if overlay_enabled {
        plan.push(Submission {
            pass: PassKind::Overlay,
            waits: vec![WaitOn::Composition],
        });
        tail = WaitOn::Overlay;
    }

    plan.push(Submission {
        pass: PassKind::PresentTarget,
        waits: vec![tail, WaitOn::Acquire],
    });

    plan
}

pub struct FrameOrchestrator {
    device: Arc<Device>,
    swapchain: Swapchain,
    descriptor_pool: Arc<DescriptorPool>,
    geometry: GeometryPass,
    composition: CompositionPass,
    present: PresentPass,
    overlay: Option<(OverlayPass, Box<dyn OverlayHook>)>,
    shadows: ShadowManager,
    last_frame: Option<Instant>,
    delta_time: f32,
}

impl FrameOrchestrator {
    pub fn new<W>(window: &W, config: &RendererConfig) -> RendererResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let device = Device::new(window)?;
        let swapchain = Swapchain::new(device.clone(), config.width, config.height, config.vsync)?;
        let extent = swapchain.extent();

        let descriptor_pool = DescriptorPool::new(
            device.clone(),
            config.pool_uniform_buffers,
            config.pool_image_samplers,
            config.pool_max_sets,
        )?;

        let geometry = GeometryPass::new(device.clone(), extent.width, extent.height)?;
        let composition = CompositionPass::new(
            device.clone(),
            descriptor_pool.clone(),
            extent.width,
            extent.height,
        )?;
        let present = PresentPass::new(
            device.clone(),
            descriptor_pool.clone(),
            &swapchain,
            composition.framebuffer(),
        )?;

        Ok(Self {
            device,
            swapchain,
            descriptor_pool,
            geometry,
            composition,
            present,
            overlay: None,
            shadows: ShadowManager::new(),
            last_frame: None,
            delta_time: 0.0,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn descriptor_pool(&self) -> &Arc<DescriptorPool> {
        &self.descriptor_pool
    }

    /// Render pass scene materials must target.
    pub fn gbuffer_render_pass(&self) -> vk::RenderPass {
        self.geometry.render_pass()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Seconds between the starts of the two most recent frames.
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    pub fn shadow_manager(&self) -> &ShadowManager {
        &self.shadows
    }

    pub fn shadow_manager_mut(&mut self) -> &mut ShadowManager {
        &mut self.shadows
    }

    /// Creates and registers a directional shadow caster at the current
    /// swapchain resolution.
    pub fn add_directional_shadow(&mut self, light: DirectionalLight) -> RendererResult<ShadowId> {
        let extent = self.swapchain.extent();
        let shadow = DirectionalShadow::new(
            self.device.clone(),
            self.descriptor_pool.clone(),
            extent.width,
            extent.height,
            light,
        )?;
        Ok(self.shadows.register_directional(shadow))
    }

    /// Creates and registers an omni-directional shadow caster at the
    /// given light position.
    pub fn add_omni_shadow(&mut self, position: Vec3) -> RendererResult<ShadowId> {
        let shadow = OmniShadow::new(self.device.clone(), self.descriptor_pool.clone(), position)?;
        Ok(self.shadows.register_omni(shadow))
    }

    /// Scene-removal hook: evicts the renderable from every per-object
    /// shadow cache.
    pub fn remove_renderable(&mut self, id: RenderableId) {
        for shadow in self.shadows.directional_mut() {
            shadow.remove_renderable(id);
        }
    }

    pub fn install_overlay(&mut self, hook: Box<dyn OverlayHook>) -> RendererResult<()> {
        let pass = OverlayPass::new(self.device.clone(), self.composition.framebuffer())?;
        self.overlay = Some((pass, hook));
        Ok(())
    }

    /// The submission plan the next `draw_frame` will follow.
    pub fn plan(&self) -> Vec<Submission> {
        plan_frame(
            true,
            self.shadows.directional_count(),
            self.shadows.omni_count(),
            self.overlay.is_some(),
        )
    }

    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.recreate_swapchain(width, height)
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> RendererResult<()> {
        self.device.wait_idle();
        self.swapchain.recreate(width, height)?;
        let extent = self.swapchain.extent();

        self.geometry.recreate(extent.width, extent.height)?;
        self.composition
            .recreate(extent.width, extent.height, self.geometry.framebuffer())?;
        if let Some((pass, _)) = self.overlay.as_mut() {
            pass.recreate(self.composition.framebuffer())?;
        }
        self.present
            .recreate(&self.swapchain, self.composition.framebuffer())?;

        log::info!("Swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Runs one frame against the scene snapshot.
    pub fn draw_frame(&mut self, frame: &mut SceneFrame) -> RendererResult<FrameStatus> {
        let now = Instant::now();
        if let Some(last) = self.last_frame {
            self.delta_time = (now - last).as_secs_f32();
        }
        self.last_frame = Some(now);

        let image_index = match self.swapchain.acquire() {
            Ok(index) => index,
            Err(RendererError::SwapchainOutOfDate) => {
                let extent = self.swapchain.extent();
                self.recreate_swapchain(extent.width, extent.height)?;
                return Ok(FrameStatus::SwapchainRebuilt);
            }
            Err(e) => return Err(e),
        };

        // Fan out: shadow casters and the G-buffer pass have no
        // dependencies on each other or on acquire.
        let mut join = Vec::new();
        for shadow in self.shadows.directional_mut() {
            shadow.build_command_buffer(frame.objects)?;
            shadow.submit(&[])?;
            join.push(shadow.semaphore());
        }
        for shadow in self.shadows.omni_mut() {
            shadow.build_command_buffer(frame.objects)?;
            shadow.submit(&[])?;
            join.push(shadow.semaphore());
        }

        self.geometry.build_command_buffer(frame.objects)?;
        self.geometry.submit(&[])?;
        join.push(self.geometry.semaphore());

        // Fan in at composition.
        self.composition.prepare(
            self.geometry.framebuffer(),
            &mut self.shadows,
            frame.lights,
            frame.view_position,
        )?;
        self.composition.build_command_buffer()?;
        self.composition.submit(&join)?;
        let mut tail = self.composition.semaphore();

        if let Some((pass, hook)) = self.overlay.as_mut() {
            pass.build_command_buffer(hook.as_mut())?;
            pass.submit(&[tail])?;
            tail = pass.semaphore();
        }

        self.present.build_command_buffer(image_index)?;
        self.present.submit(
            image_index,
            &[tail, self.swapchain.image_available_semaphore()],
            &[self.swapchain.render_finished_semaphore()],
        )?;

        let needs_recreate = self.swapchain.present(image_index)?;

        // Every pass re-records its single command buffer next frame; the
        // queue must drain before recording starts again.
        self.device.wait_queue_idle()?;

        if needs_recreate {
            let extent = self.swapchain.extent();
            self.recreate_swapchain(extent.width, extent.height)?;
        }

        Ok(FrameStatus::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unacquired_frame_submits_nothing() {
        assert!(plan_frame(false, 2, 1, true).is_empty());
    }

    #[test]
    fn composition_joins_all_shadows_and_gbuffer() {
        let plan = plan_frame(true, 2, 1, false);

        let composition = plan
            .iter()
            .find(|s| s.pass == PassKind::Composition)
            .unwrap();
        assert_eq!(composition.waits.len(), 4);
        assert!(composition.waits.contains(&WaitOn::DirectionalShadow(0)));
        assert!(composition.waits.contains(&WaitOn::DirectionalShadow(1)));
        assert!(composition.waits.contains(&WaitOn::OmniShadow(0)));
        assert!(composition.waits.contains(&WaitOn::GBuffer));
    }

    #[test]
    fn shadow_and_gbuffer_submissions_have_no_waits() {
        let plan = plan_frame(true, 1, 1, false);
        for submission in &plan {
            match submission.pass {
                PassKind::DirectionalShadow(_) | PassKind::OmniShadow(_) | PassKind::GBuffer => {
                    assert!(submission.waits.is_empty());
                }
                _ => {}
            }
        }
    }

    #[test]
    fn present_target_waits_on_acquire_and_tail() {
        let without_overlay = plan_frame(true, 0, 0, false);
        let present = without_overlay.last().unwrap();
        assert_eq!(present.pass, PassKind::PresentTarget);
        assert!(present.waits.contains(&WaitOn::Acquire));
        assert!(present.waits.contains(&WaitOn::Composition));

        let with_overlay = plan_frame(true, 0, 0, true);
        let present = with_overlay.last().unwrap();
        assert!(present.waits.contains(&WaitOn::Overlay));
        assert!(!present.waits.contains(&WaitOn::Composition));
    }

    #[test]
    fn each_semaphore_is_waited_exactly_once() {
        let plan = plan_frame(true, 3, 2, true);
        let mut waited = Vec::new();
        for submission in &plan {
            for wait in &submission.waits {
                assert!(!waited.contains(wait), "{:?} waited twice", wait);
                waited.push(*wait);
            }
        }
        // Every pass that signals is also waited on
        assert_eq!(waited.len(), 3 + 2 + 1 /* gbuffer */ + 1 /* composition */ + 1 /* overlay */ + 1 /* acquire */);
    }
}
