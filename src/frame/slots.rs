// Frame slots
//
// One slot per swapchain image. Each slot carries a dynamic and a static
// command buffer, each guarded by its own fence, plus the three semaphores
// that chain acquire -> dynamic -> static -> present.

use ash::vk;

use super::BufferRole;
use crate::backend::{GpuBackend, Submission};
use crate::error::{FrameError, FrameResult};
use crate::sync::ACQUIRE_WAIT_STAGES;

/// CPU-side view of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Known signaled; the buffer is free
    Signaled,
    /// Reset and not yet handed to a submission
    Reset,
    /// Submitted; the GPU may still own the buffer
    Pending,
}

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// Surface changed under us; rebuild before trying again
    Stale,
}

#[derive(Debug)]
struct GuardedBuffer {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    state: FenceState,
}

/// Per-image synchronization and command state
#[derive(Debug)]
pub struct FrameSlot {
    dynamic: GuardedBuffer,
    fixed: GuardedBuffer,
    acquire: vk::Semaphore,
    dynamic_complete: vk::Semaphore,
    render_complete: vk::Semaphore,
}

impl FrameSlot {
    fn new<B: GpuBackend + ?Sized>(backend: &B) -> FrameResult<Self> {
        let buffers = backend.allocate_command_buffers(2)?;
        let guarded = |cmd| -> FrameResult<GuardedBuffer> {
            Ok(GuardedBuffer {
                cmd,
                fence: backend.create_fence(true)?, // Start signaled
                state: FenceState::Signaled,
            })
        };

        Ok(Self {
            dynamic: guarded(buffers[0])?,
            fixed: guarded(buffers[1])?,
            acquire: backend.create_semaphore()?,
            dynamic_complete: backend.create_semaphore()?,
            render_complete: backend.create_semaphore()?,
        })
    }

    fn buffer(&self, role: BufferRole) -> &GuardedBuffer {
        match role {
            BufferRole::Dynamic => &self.dynamic,
            BufferRole::Static => &self.fixed,
        }
    }

    fn buffer_mut(&mut self, role: BufferRole) -> &mut GuardedBuffer {
        match role {
            BufferRole::Dynamic => &mut self.dynamic,
            BufferRole::Static => &mut self.fixed,
        }
    }

    pub fn command_buffer(&self, role: BufferRole) -> vk::CommandBuffer {
        self.buffer(role).cmd
    }

    pub fn fence(&self, role: BufferRole) -> vk::Fence {
        self.buffer(role).fence
    }

    pub fn fence_state(&self, role: BufferRole) -> FenceState {
        self.buffer(role).state
    }

    /// Signaled by the acquire that handed out this slot's image
    pub fn acquire_semaphore(&self) -> vk::Semaphore {
        self.acquire
    }

    pub fn dynamic_complete(&self) -> vk::Semaphore {
        self.dynamic_complete
    }

    pub fn render_complete(&self) -> vk::Semaphore {
        self.render_complete
    }

    fn destroy<B: GpuBackend + ?Sized>(&self, backend: &B) {
        backend.free_command_buffers(&[self.dynamic.cmd, self.fixed.cmd]);
        backend.destroy_fence(self.dynamic.fence);
        backend.destroy_fence(self.fixed.fence);
        backend.destroy_semaphore(self.acquire);
        backend.destroy_semaphore(self.dynamic_complete);
        backend.destroy_semaphore(self.render_complete);
    }
}

/// Owns one `FrameSlot` per swapchain image
pub struct FrameSlotManager {
    slots: Vec<FrameSlot>,
    /// Handed to the next acquire; the image index is not known beforehand
    spare_acquire: vk::Semaphore,
    fence_timeout_ns: u64,
}

impl FrameSlotManager {
    pub fn new<B: GpuBackend + ?Sized>(
        backend: &B,
        count: usize,
        fence_timeout_ns: u64,
    ) -> FrameResult<Self> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(FrameSlot::new(backend)?);
        }
        let spare_acquire = backend.create_semaphore()?;

        log::info!("Created {} frame slots", count);
        Ok(Self { slots, spare_acquire, fence_timeout_ns })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> FrameResult<&FrameSlot> {
        let count = self.slots.len();
        self.slots
            .get(index)
            .ok_or(FrameError::SlotOutOfRange { index, count })
    }

    fn slot_mut(&mut self, index: usize) -> FrameResult<&mut FrameSlot> {
        let count = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(FrameError::SlotOutOfRange { index, count })
    }

    /// Ask the swapchain for the next image. Fences are not touched, so a
    /// stale surface leaves every slot as it was.
    pub fn acquire<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &B,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
    ) -> FrameResult<AcquireOutcome> {
        let (image_index, suboptimal) =
            match backend.acquire_next_image(swapchain, timeout_ns, self.spare_acquire) {
                Ok(result) => result,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("Acquire reported out-of-date surface");
                    return Ok(AcquireOutcome::Stale);
                }
                Err(e) => return Err(e.into()),
            };

        let spare = self.spare_acquire;
        let slot = self.slot_mut(image_index as usize)?;
        // The semaphore just signaled now belongs to the slot; the slot's
        // previous one was already waited on and becomes the spare
        let previous = std::mem::replace(&mut slot.acquire, spare);
        self.spare_acquire = previous;

        Ok(AcquireOutcome::Acquired { image_index, suboptimal })
    }

    /// Block until the buffer's last submission finished, then reset its
    /// fence. A fence that is already reset was never submitted again, so
    /// waiting on it would never return.
    pub fn wait_and_reset<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &B,
        index: usize,
        role: BufferRole,
    ) -> FrameResult<()> {
        let timeout = self.fence_timeout_ns;
        let buffer = self.slot_mut(index)?.buffer_mut(role);

        match buffer.state {
            FenceState::Reset => return Ok(()),
            FenceState::Pending => backend.wait_for_fences(&[buffer.fence], timeout)?,
            FenceState::Signaled => {}
        }
        backend.reset_fences(&[buffer.fence])?;
        buffer.state = FenceState::Reset;
        Ok(())
    }

    /// Begin recording into a buffer the GPU no longer owns
    pub fn begin_recording<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        index: usize,
        role: BufferRole,
    ) -> FrameResult<vk::CommandBuffer> {
        let buffer = self.slot(index)?.buffer(role);
        if buffer.state == FenceState::Pending {
            return Err(FrameError::BufferInFlight { slot: index, role });
        }

        backend.begin_command_buffer(buffer.cmd, role == BufferRole::Dynamic)?;
        Ok(buffer.cmd)
    }

    /// Drop a half-recorded buffer and begin it again from scratch
    pub fn restart_recording<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        index: usize,
        role: BufferRole,
    ) -> FrameResult<vk::CommandBuffer> {
        let buffer = self.slot(index)?.buffer(role);
        if buffer.state == FenceState::Pending {
            return Err(FrameError::BufferInFlight { slot: index, role });
        }

        backend.reset_command_buffer(buffer.cmd)?;
        backend.begin_command_buffer(buffer.cmd, role == BufferRole::Dynamic)?;
        Ok(buffer.cmd)
    }

    pub fn end_recording<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        index: usize,
        role: BufferRole,
    ) -> FrameResult<()> {
        backend.end_command_buffer(self.slot(index)?.buffer(role).cmd)
    }

    /// Submit one of the slot's buffers into the semaphore chain.
    ///
    /// Dynamic waits on the acquire semaphore and signals dynamic-complete.
    /// Static waits on dynamic-complete and signals render-complete.
    pub fn submit<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &B,
        index: usize,
        role: BufferRole,
    ) -> FrameResult<()> {
        let slot = self.slot_mut(index)?;
        let (wait, wait_stage, signal) = match role {
            BufferRole::Dynamic => (slot.acquire, ACQUIRE_WAIT_STAGES, slot.dynamic_complete),
            BufferRole::Static => (
                slot.dynamic_complete,
                vk::PipelineStageFlags::ALL_COMMANDS,
                slot.render_complete,
            ),
        };

        let buffer = slot.buffer_mut(role);
        if buffer.state != FenceState::Reset {
            return Err(FrameError::FenceNotReset { slot: index, role });
        }

        let submission = Submission {
            wait_semaphores: &[wait],
            wait_stages: &[wait_stage],
            command_buffers: &[buffer.cmd],
            signal_semaphores: &[signal],
        };
        backend.queue_submit(&submission, buffer.fence)?;
        buffer.state = FenceState::Pending;
        Ok(())
    }

    /// Wait for every pending fence. Fences end up signaled, not reset.
    pub fn wait_all<B: GpuBackend + ?Sized>(&mut self, backend: &B) -> FrameResult<()> {
        let pending: Vec<vk::Fence> = self
            .slots
            .iter()
            .flat_map(|s| [&s.dynamic, &s.fixed])
            .filter(|b| b.state == FenceState::Pending)
            .map(|b| b.fence)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        backend.wait_for_fences(&pending, self.fence_timeout_ns)?;
        for slot in &mut self.slots {
            for buffer in [&mut slot.dynamic, &mut slot.fixed] {
                if buffer.state == FenceState::Pending {
                    buffer.state = FenceState::Signaled;
                }
            }
        }
        log::debug!("Drained {} in-flight fences", pending.len());
        Ok(())
    }

    /// Slots whose frame has been submitted but not yet finished on the GPU
    pub fn frames_in_flight<B: GpuBackend + ?Sized>(&self, backend: &B) -> FrameResult<usize> {
        let mut count = 0;
        for slot in &self.slots {
            if slot.fixed.state == FenceState::Pending && !backend.fence_signaled(slot.fixed.fence)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Match the slot count to a rebuilt swapchain
    pub fn rebuild<B: GpuBackend + ?Sized>(&mut self, backend: &B, count: usize) -> FrameResult<()> {
        self.wait_all(backend)?;
        if count == self.slots.len() {
            return Ok(());
        }

        log::info!("Frame slots: {} -> {}", self.slots.len(), count);
        while self.slots.len() > count {
            if let Some(slot) = self.slots.pop() {
                slot.destroy(backend);
            }
        }
        while self.slots.len() < count {
            self.slots.push(FrameSlot::new(backend)?);
        }
        Ok(())
    }

    /// Release every handle. The caller makes sure the device is idle.
    pub fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &B) {
        for slot in self.slots.drain(..) {
            slot.destroy(backend);
        }
        if self.spare_acquire != vk::Semaphore::null() {
            backend.destroy_semaphore(self.spare_acquire);
            self.spare_acquire = vk::Semaphore::null();
        }
    }
}
