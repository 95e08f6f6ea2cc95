//! Per-frame CPU/GPU synchronization.
//!
//! The renderer is single-buffered: one command buffer, one fence and one pair of
//! semaphores are reused by every frame. A frame moves through
//!
//! ```text
//! Idle -> WaitingOnFence -> ImageAcquired -> Recording -> Submitted -> Presented -> Idle
//! ```
//!
//! 1. Wait on the fence signaled by the previous submission, then reset it
//! 2. Acquire a swapchain image (signals the acquire semaphore)
//! 3. Reset and re-record the command buffer against the acquired framebuffer
//! 4. Submit, waiting on the acquire semaphore at color output, signaling the render
//!    semaphore and the fence
//! 5. Present, waiting on the render semaphore
//!
//! A frame that fails after acquiring its image still submits and presents, with an empty
//! batch, so the acquire semaphore is consumed and the image returns to the swapchain.

use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::{DisplaySurface, RenderBackend};
use crate::renderer::config::RenderConfig;
use crate::renderer::error::RenderError;
use crate::renderer::pipeline::{CompiledPipeline, RenderPassTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    WaitingOnFence,
    ImageAcquired,
    Recording,
    Submitted,
    Presented,
}

#[derive(Debug)]
pub enum SkipReason {
    /// The surface is minimized or has no area
    SurfaceUnrenderable,
    /// Setup did not complete, so there is nothing to draw with
    NotReady,
    Transient(RenderError),
}

#[derive(Debug)]
pub enum FrameOutcome {
    Presented { image_index: u32 },
    Skipped(SkipReason),
    /// The render loop must stop; the owner should shut the renderer down
    Fatal(RenderError),
}

impl FrameOutcome {
    pub fn is_presented(&self) -> bool {
        matches!(self, Self::Presented { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstants {
    pub stages: vk::ShaderStageFlags,
    pub bytes: Vec<u8>,
}

/// One pipeline bind, optional vertex buffer bind, optional push constant upload and draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCall {
    pub pipeline: CompiledPipeline,
    pub vertex_buffer: Option<vk::Buffer>,
    pub vertex_count: u32,
    pub push_constants: Option<PushConstants>,
}

/// Everything the frame records, derived from the frame number
#[derive(Debug, Clone, Default)]
pub struct FramePlan {
    pub clear_color: [f32; 4],
    pub draws: Vec<DrawCall>,
}

/// Render pass and one framebuffer per swapchain image
#[derive(Debug, Clone)]
pub struct RenderTargets {
    pub pass: RenderPassTarget,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

/// Commands recorded into the command buffer for one frame
pub struct FrameRecording<'a> {
    pub target: &'a RenderPassTarget,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub draws: &'a [DrawCall],
}

/// A null `command_buffer` submits an empty batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

pub struct FrameState {
    pub command_buffer: vk::CommandBuffer,
    // Signals when all rendering commands have finished execution.
    pub wait_fence: vk::Fence,
    // Signals when the swapchain image is ready to be rendered to.
    pub acquire_semaphore: vk::Semaphore,
    // Signals when rendering has finished and the image can be presented.
    pub render_semaphore: vk::Semaphore,
    pub frame_counter: u64,

    // True while the fence is signaled or will be signaled by submitted work
    fence_pending: bool,
}

impl FrameState {
    /// `wait_fence` must have been created signaled.
    pub fn new(
        command_buffer: vk::CommandBuffer,
        wait_fence: vk::Fence,
        acquire_semaphore: vk::Semaphore,
        render_semaphore: vk::Semaphore,
    ) -> Self {
        Self {
            command_buffer,
            wait_fence,
            acquire_semaphore,
            render_semaphore,
            frame_counter: 0,
            fence_pending: true,
        }
    }
}

pub struct FrameSynchronizer {
    state: FrameState,
    phase: FramePhase,
    timeout_ns: u64,
}

impl FrameSynchronizer {
    pub fn new(state: FrameState, config: &RenderConfig) -> Self {
        Self {
            state,
            phase: FramePhase::Idle,
            timeout_ns: config.fence_timeout_ns(),
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.state.frame_counter
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    /// Runs one full frame. `plan` is called with the frame number once an image was acquired.
    pub fn run_cycle<B, S, F>(
        &mut self,
        backend: &B,
        surface: &S,
        targets: &RenderTargets,
        plan: F,
    ) -> FrameOutcome
    where
        B: RenderBackend + ?Sized,
        S: DisplaySurface + ?Sized,
        F: FnOnce(u64, vk::Extent2D) -> FramePlan,
    {
        // Checked before touching the fence so a skipped frame leaves it signaled
        if surface.is_unrenderable() {
            log::trace!("Surface unrenderable, skipping frame {}", self.state.frame_counter);
            return FrameOutcome::Skipped(SkipReason::SurfaceUnrenderable);
        }

        let outcome = match self.cycle(backend, targets, plan) {
            Ok(image_index) => {
                self.state.frame_counter += 1;
                FrameOutcome::Presented { image_index }
            }
            Err(err) if err.is_fatal() => {
                log::error!("Frame {} failed: {}", self.state.frame_counter, err);
                FrameOutcome::Fatal(err)
            }
            Err(err) => {
                log::warn!("Frame {} skipped: {}", self.state.frame_counter, err);
                FrameOutcome::Skipped(SkipReason::Transient(err))
            }
        };
        self.enter(FramePhase::Idle);
        outcome
    }

    fn cycle<B, F>(
        &mut self,
        backend: &B,
        targets: &RenderTargets,
        plan: F,
    ) -> Result<u32, RenderError>
    where
        B: RenderBackend + ?Sized,
        F: FnOnce(u64, vk::Extent2D) -> FramePlan,
    {
        self.enter(FramePhase::WaitingOnFence);
        if self.state.fence_pending {
            backend
                .wait_for_fence(self.state.wait_fence, self.timeout_ns)
                .map_err(|status| RenderError::FatalDeviceFailure {
                    phase: FramePhase::WaitingOnFence,
                    status,
                })?;
            // Only reset once the wait has succeeded
            backend
                .reset_fence(self.state.wait_fence)
                .map_err(|status| frame_failure(FramePhase::WaitingOnFence, status))?;
            self.state.fence_pending = false;
        }

        let (image_index, suboptimal) = backend
            .acquire_next_image(self.state.acquire_semaphore, self.timeout_ns)
            .map_err(|status| frame_failure(FramePhase::ImageAcquired, status))?;
        self.enter(FramePhase::ImageAcquired);
        if suboptimal {
            log::warn!("Swapchain image {} is suboptimal for the surface", image_index);
        }

        // The image is ours and the acquire semaphore is signaled until a submission waits on it
        if let Err(err) = self.render(backend, targets, image_index, plan) {
            if !err.is_fatal() {
                self.release_image(backend, image_index)?;
            }
            return Err(err);
        }

        match backend.present(image_index, self.state.render_semaphore) {
            Ok(false) => {}
            Ok(true) => log::warn!("Presented to a suboptimal swapchain"),
            Err(status @ (
                vk::Result::ERROR_DEVICE_LOST
                | vk::Result::ERROR_OUT_OF_DATE_KHR
                | vk::Result::ERROR_SURFACE_LOST_KHR
            )) => return Err(frame_failure(FramePhase::Presented, status)),
            Err(status) => log::warn!("Present returned {}, continuing", status),
        }
        self.enter(FramePhase::Presented);

        Ok(image_index)
    }

    /// Records the frame into the acquired framebuffer and submits it
    fn render<B, F>(
        &mut self,
        backend: &B,
        targets: &RenderTargets,
        image_index: u32,
        plan: F,
    ) -> Result<(), RenderError>
    where
        B: RenderBackend + ?Sized,
        F: FnOnce(u64, vk::Extent2D) -> FramePlan,
    {
        let framebuffer = *targets
            .framebuffers
            .get(image_index as usize)
            .ok_or_else(|| {
                log::error!(
                    "Acquired image {} but only {} framebuffers exist",
                    image_index,
                    targets.framebuffers.len(),
                );
                frame_failure(FramePhase::ImageAcquired, vk::Result::ERROR_UNKNOWN)
            })?;

        self.enter(FramePhase::Recording);
        let mut plan = plan(self.state.frame_counter, targets.extent);
        plan.draws.retain(|draw| {
            if draw.pipeline.is_null() {
                log::warn!("Skipping draw with an unavailable pipeline");
            }
            !draw.pipeline.is_null()
        });

        let command_buffer = self.state.command_buffer;
        backend
            .reset_command_buffer(command_buffer)
            .map_err(|status| frame_failure(FramePhase::Recording, status))?;
        backend
            .record_frame(command_buffer, &FrameRecording {
                target: &targets.pass,
                framebuffer,
                extent: targets.extent,
                clear_color: plan.clear_color,
                draws: &plan.draws,
            })
            .map_err(|status| frame_failure(FramePhase::Recording, status))?;

        self.submit(backend, command_buffer)
            .map_err(|status| frame_failure(FramePhase::Submitted, status))
    }

    /// Hands an acquired image back without rendering to it.
    ///
    /// An empty submission consumes the acquire semaphore and signals the render semaphore
    /// and the fence, then the image is presented unchanged. Failing here leaves the
    /// semaphore signaled with nothing to consume it, so no later frame can acquire.
    fn release_image<B>(&mut self, backend: &B, image_index: u32) -> Result<(), RenderError>
    where
        B: RenderBackend + ?Sized,
    {
        log::debug!("Returning image {} to the swapchain unrendered", image_index);
        self.submit(backend, vk::CommandBuffer::null())
            .map_err(|status| RenderError::FatalDeviceFailure {
                phase: FramePhase::Submitted,
                status,
            })?;

        match backend.present(image_index, self.state.render_semaphore) {
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RenderError::FatalDeviceFailure {
                phase: FramePhase::Presented,
                status: vk::Result::ERROR_DEVICE_LOST,
            }),
            Err(status) => {
                log::warn!("Present of unrendered image {} returned {}", image_index, status);
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    fn submit<B>(&mut self, backend: &B, command_buffer: vk::CommandBuffer) -> VkResult<()>
    where
        B: RenderBackend + ?Sized,
    {
        backend.submit(&Submission {
            command_buffer,
            wait_semaphore: self.state.acquire_semaphore,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: self.state.render_semaphore,
            fence: self.state.wait_fence,
        })?;
        self.state.fence_pending = true;
        self.enter(FramePhase::Submitted);
        Ok(())
    }

    fn enter(&mut self, phase: FramePhase) {
        log::trace!("Frame {}: {:?} -> {:?}", self.state.frame_counter, self.phase, phase);
        self.phase = phase;
    }
}

fn frame_failure(phase: FramePhase, status: vk::Result) -> RenderError {
    match status {
        vk::Result::ERROR_DEVICE_LOST => RenderError::FatalDeviceFailure { phase, status },
        _ => RenderError::TransientFrameFailure { phase, status },
    }
}
