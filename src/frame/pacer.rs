// Frame pacer
//
// Drives one frame per `draw()`:
//   acquire -> wait/reset dynamic fence -> record + submit dynamic
//   -> wait/reset static fence -> submit static -> present
//
// Out-of-date and suboptimal surfaces are absorbed here: the swapchain is
// rebuilt and the caller sees at most one dropped frame.

use std::sync::Arc;

use ash::vk;

use super::lifecycle::SwapchainLifecycle;
use super::slots::{AcquireOutcome, FrameSlotManager};
use super::BufferRole;
use crate::backend::{GpuBackend, RenderPassInfo, SwapchainDesc};
use crate::error::{FrameError, FrameResult};

/// Records the per-frame buffer: `(backend, cmd, image_index)`
pub type DynamicRecorder<B> = Box<dyn FnMut(&B, vk::CommandBuffer, u32) -> anyhow::Result<()>>;

/// Records a static buffer: `(backend, cmd, image_index, render_pass)`.
/// Must run the supplied render pass; see `FramePacer::record_static`.
pub type StaticRecorder<B> =
    Box<dyn FnMut(&B, vk::CommandBuffer, u32, &RenderPassInfo) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub swapchain: SwapchainDesc,
    pub clear_color: [f32; 4],
    pub acquire_timeout_ns: u64,
    pub fence_timeout_ns: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            swapchain: SwapchainDesc {
                extent: vk::Extent2D { width: 1280, height: 720 },
                present_mode: vk::PresentModeKHR::FIFO,
                strict_present_mode: false,
                depth_format: vk::Format::D32_SFLOAT,
            },
            clear_color: [0.0, 0.0, 0.0, 1.0],
            acquire_timeout_ns: u64::MAX,
            fence_timeout_ns: u64::MAX,
        }
    }
}

/// Where the pacer is within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    Acquiring,
    RecordingDynamic,
    SubmittingDynamic,
    RecordingStatic,
    SubmittingStatic,
    Presenting,
}

impl PacerState {
    /// Legal edges of the frame state machine. Every state may fall back to
    /// `Idle` when the surface goes stale.
    pub fn can_advance(self, next: PacerState) -> bool {
        use PacerState::*;
        if next == Idle {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Idle, RecordingStatic)
                | (Acquiring, RecordingDynamic)
                | (RecordingDynamic, SubmittingDynamic)
                | (SubmittingDynamic, RecordingStatic)
                | (SubmittingDynamic, SubmittingStatic)
                | (RecordingStatic, SubmittingStatic)
                | (SubmittingStatic, Presenting)
        )
    }
}

/// Outcome of one `draw()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { frame_index: u64, image_index: u32 },
    /// Surface went stale; the swapchain was rebuilt
    Dropped,
    /// Nothing to draw into (minimized window)
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub dropped: u64,
    pub recreations: u64,
}

pub struct FramePacer<B: GpuBackend> {
    backend: Arc<B>,
    slots: FrameSlotManager,
    lifecycle: SwapchainLifecycle,
    config: PacerConfig,
    state: PacerState,
    dynamic_recorder: Option<DynamicRecorder<B>>,
    static_recorder: Option<StaticRecorder<B>>,
    stats: FrameStats,
    frame_index: u64,
    pending_extent: Option<vk::Extent2D>,
    shut_down: bool,
}

impl<B: GpuBackend> FramePacer<B> {
    /// Build swapchain targets and one slot per image. Static buffers get a
    /// plain clear pass until `record_static` supplies a recorder.
    pub fn new(backend: Arc<B>, render_pass: vk::RenderPass, config: PacerConfig) -> FrameResult<Self> {
        let lifecycle = SwapchainLifecycle::new(&*backend, render_pass, config.swapchain)?;
        let slots = FrameSlotManager::new(&*backend, lifecycle.image_count(), config.fence_timeout_ns)?;

        let mut pacer = Self {
            backend,
            slots,
            lifecycle,
            config,
            state: PacerState::Idle,
            dynamic_recorder: None,
            static_recorder: None,
            stats: FrameStats::default(),
            frame_index: 0,
            pending_extent: None,
            shut_down: false,
        };
        pacer.rerecord_static()?;
        Ok(pacer)
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn lifecycle(&self) -> &SwapchainLifecycle {
        &self.lifecycle
    }

    pub fn image_count(&self) -> usize {
        self.slots.len()
    }

    /// Frames submitted whose static work has not finished yet
    pub fn frames_in_flight(&self) -> FrameResult<usize> {
        self.slots.frames_in_flight(&*self.backend)
    }

    /// Install the per-frame recorder. It runs once per `draw()`.
    pub fn record_dynamic<F>(&mut self, recorder: F)
    where
        F: FnMut(&B, vk::CommandBuffer, u32) -> anyhow::Result<()> + 'static,
    {
        self.dynamic_recorder = Some(Box::new(recorder));
    }

    /// Install the static recorder and re-record every static buffer now.
    /// It runs again after each swapchain rebuild.
    ///
    /// The recorder must begin and end the render pass described by its
    /// `RenderPassInfo`. That pass leaves the swapchain image in the present
    /// layout, and the image's tracked layout is committed to `Present`
    /// once the recorder returns.
    pub fn record_static<F>(&mut self, recorder: F) -> FrameResult<()>
    where
        F: FnMut(&B, vk::CommandBuffer, u32, &RenderPassInfo) -> anyhow::Result<()> + 'static,
    {
        self.static_recorder = Some(Box::new(recorder));
        self.rerecord_static()
    }

    /// Rebuild at the new size before the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        log::debug!("Resize requested: {}x{}", width, height);
        self.pending_extent = Some(vk::Extent2D { width, height });
    }

    /// Run one frame.
    ///
    /// A failing recorder does not break the semaphore chain: its buffer is
    /// replaced by an empty one, the frame is still submitted and presented,
    /// and the error is returned afterwards. The next call starts clean.
    pub fn draw(&mut self) -> FrameResult<FrameStatus> {
        let status = self.draw_frame();
        if status.is_err() {
            self.state = PacerState::Idle;
        }
        status
    }

    fn draw_frame(&mut self) -> FrameResult<FrameStatus> {
        if self.shut_down {
            return Err(FrameError::TargetsMissing);
        }

        if let Some(extent) = self.pending_extent {
            if extent.width == 0 || extent.height == 0 {
                return Ok(FrameStatus::Skipped);
            }
            self.pending_extent = None;
            if !self.recreate(extent)? {
                return Ok(FrameStatus::Skipped);
            }
        }

        // Torn down by a zero-sized surface; retry until it has area again
        if !self.lifecycle.is_built() && !self.recreate(self.lifecycle.extent())? {
            return Ok(FrameStatus::Skipped);
        }

        // Acquire
        self.advance(PacerState::Acquiring);
        let swapchain = self.lifecycle.swapchain()?;
        let outcome = self
            .slots
            .acquire(&*self.backend, swapchain, self.config.acquire_timeout_ns)?;
        let (image_index, acquire_suboptimal) = match outcome {
            AcquireOutcome::Acquired { image_index, suboptimal } => (image_index, suboptimal),
            AcquireOutcome::Stale => {
                // No fence was touched and the acquire semaphore was never signaled
                self.advance(PacerState::Idle);
                self.stats.dropped += 1;
                self.recreate(self.lifecycle.extent())?;
                return Ok(FrameStatus::Dropped);
            }
        };
        let slot = image_index as usize;

        // Dynamic buffer
        self.advance(PacerState::RecordingDynamic);
        let recorder_error = self.record_dynamic_buffer(slot, image_index)?;
        self.advance(PacerState::SubmittingDynamic);
        self.slots.submit(&*self.backend, slot, BufferRole::Dynamic)?;

        // Static buffer, recorded ahead of time
        self.advance(PacerState::SubmittingStatic);
        self.slots.wait_and_reset(&*self.backend, slot, BufferRole::Static)?;
        self.slots.submit(&*self.backend, slot, BufferRole::Static)?;

        // Present
        self.advance(PacerState::Presenting);
        let render_complete = self.slots.slot(slot)?.render_complete();
        let presented = self.backend.queue_present(swapchain, image_index, &[render_complete]);
        self.advance(PacerState::Idle);

        let status = match presented {
            Ok(present_suboptimal) => {
                if acquire_suboptimal || present_suboptimal {
                    log::debug!("Surface suboptimal, rebuilding after frame {}", self.frame_index);
                    self.recreate(self.lifecycle.extent())?;
                }
                if recorder_error.is_some() {
                    FrameStatus::Dropped
                } else {
                    let frame_index = self.frame_index;
                    self.frame_index += 1;
                    self.stats.presented += 1;
                    FrameStatus::Presented { frame_index, image_index }
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Present reported out-of-date surface");
                self.recreate(self.lifecycle.extent())?;
                FrameStatus::Dropped
            }
            Err(e) => return Err(e.into()),
        };

        if status == FrameStatus::Dropped {
            self.stats.dropped += 1;
        }
        match recorder_error {
            Some(e) => Err(FrameError::Callback(e)),
            None => Ok(status),
        }
    }

    /// Record the per-frame buffer. A recorder failure is handed back
    /// instead of propagated; the buffer is then left empty but submittable.
    fn record_dynamic_buffer(&mut self, slot: usize, image_index: u32) -> FrameResult<Option<anyhow::Error>> {
        let backend = &*self.backend;
        self.slots.wait_and_reset(backend, slot, BufferRole::Dynamic)?;
        let cmd = self.slots.begin_recording(backend, slot, BufferRole::Dynamic)?;

        let recorded = match self.dynamic_recorder.as_mut() {
            Some(record) => record(backend, cmd, image_index),
            None => Ok(()),
        };
        let failure = match recorded {
            Ok(()) => None,
            Err(e) => {
                log::error!("Dynamic recorder failed for image {}: {:#}", image_index, e);
                self.slots.restart_recording(backend, slot, BufferRole::Dynamic)?;
                Some(e)
            }
        };

        self.slots.end_recording(backend, slot, BufferRole::Dynamic)?;
        Ok(failure)
    }

    fn rerecord_static(&mut self) -> FrameResult<()> {
        if !self.lifecycle.is_built() {
            // Recorded once the swapchain is back
            return Ok(());
        }
        self.advance(PacerState::RecordingStatic);
        let result = self.record_static_buffers();
        self.advance(PacerState::Idle);
        result
    }

    /// Record every static buffer. A failing recorder leaves that image
    /// with the plain clear pass so every buffer stays submittable; the
    /// first failure is returned once all images are recorded.
    fn record_static_buffers(&mut self) -> FrameResult<()> {
        let backend = &*self.backend;
        self.slots.wait_all(backend)?;

        let mut first_failure = None;
        for index in 0..self.slots.len() {
            let info = self.lifecycle.render_pass_info(index, self.config.clear_color)?;
            let mut cmd = self.slots.begin_recording(backend, index, BufferRole::Static)?;

            let recorded = match self.static_recorder.as_mut() {
                Some(record) => record(backend, cmd, index as u32, &info),
                None => {
                    Self::clear_pass(backend, cmd, &info);
                    Ok(())
                }
            };
            if let Err(e) = recorded {
                log::error!("Static recorder failed for image {}: {:#}", index, e);
                cmd = self.slots.restart_recording(backend, index, BufferRole::Static)?;
                Self::clear_pass(backend, cmd, &info);
                first_failure.get_or_insert(e);
            }

            self.slots.end_recording(backend, index, BufferRole::Static)?;
            self.lifecycle.mark_presentable(index);
        }

        log::debug!("Recorded {} static command buffers", self.slots.len());
        match first_failure {
            Some(e) => Err(FrameError::Callback(e)),
            None => Ok(()),
        }
    }

    fn clear_pass(backend: &B, cmd: vk::CommandBuffer, info: &RenderPassInfo) {
        backend.begin_render_pass(cmd, info);
        backend.end_render_pass(cmd);
    }

    /// Rebuild swapchain targets. `false` means the surface is zero-sized
    /// and nothing was built.
    fn recreate(&mut self, extent: vk::Extent2D) -> FrameResult<bool> {
        if !self.lifecycle.recreate(&*self.backend, &mut self.slots, extent)? {
            return Ok(false);
        }
        self.stats.recreations += 1;
        self.rerecord_static()?;
        Ok(true)
    }

    fn advance(&mut self, next: PacerState) {
        debug_assert!(
            self.state.can_advance(next),
            "illegal frame state transition {:?} -> {:?}",
            self.state,
            next
        );
        log::trace!("Frame state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Wait for the device, then release slots and swapchain targets.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) -> FrameResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let backend = &*self.backend;
        backend.wait_idle()?;
        self.slots.wait_all(backend)?;
        self.slots.destroy(backend);
        self.lifecycle.destroy(backend);

        log::info!(
            "Frame pacer shut down: {} presented, {} dropped, {} swapchain rebuilds",
            self.stats.presented,
            self.stats.dropped,
            self.stats.recreations
        );
        Ok(())
    }
}

impl<B: GpuBackend> Drop for FramePacer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Frame pacer shutdown failed: {}", e);
        }
    }
}
