// Simulated GPU for tests
//
// Deterministic stand-in for `VulkanBackend`. Work completes `latency`
// submissions after it was queued; waiting on an unfinished fence counts as
// a blocking wait and fast-forwards the clock. Misuse of fences, semaphores
// and command buffers is recorded in `violations` instead of crashing.

use std::collections::{HashMap, HashSet};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::{CommandRecorder, GpuBackend, RenderPassInfo, Submission, SwapchainDesc, SwapchainImages};
use crate::error::{FrameError, FrameResult};
use crate::sync::{GpuImage, LayoutKind};

#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordedBarrier {
    pub cmd: vk::CommandBuffer,
    pub image: vk::Image,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimFence {
    Signaled,
    Unsignaled,
    Pending { complete_at: u64 },
}

#[derive(Debug, Default)]
struct SimCommandBuffer {
    recording: bool,
    /// Fence of the last submission that used this buffer
    in_flight: Option<vk::Fence>,
}

#[derive(Debug)]
struct SimSwapchain {
    images: Vec<vk::Image>,
    next: usize,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    latency: u64,
    tick: u64,
    image_count: u32,
    /// Extent the surface reports, overriding the requested one
    surface_extent: Option<vk::Extent2D>,
    supported_present_modes: Vec<vk::PresentModeKHR>,

    fences: HashMap<vk::Fence, SimFence>,
    semaphores: HashMap<vk::Semaphore, bool>,
    command_buffers: HashMap<vk::CommandBuffer, SimCommandBuffer>,
    swapchains: HashMap<vk::SwapchainKHR, SimSwapchain>,
    /// View -> (base mip, level count)
    views: HashMap<vk::ImageView, (u32, u32)>,
    images: HashSet<vk::Image>,
    buffers: HashSet<vk::Buffer>,
    framebuffers: HashMap<vk::Framebuffer, vk::Extent2D>,

    acquire_calls: usize,
    present_calls: usize,
    inject_acquire: HashMap<usize, vk::Result>,
    inject_present: HashMap<usize, vk::Result>,

    barriers: Vec<RecordedBarrier>,
    barrier_calls: usize,
    copies: usize,
    presents: Vec<u32>,
    swapchains_created: usize,
    blocking_waits: usize,
    max_pending_fences: usize,
    violations: Vec<String>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Retire everything whose completion time has passed
    fn advance(&mut self) {
        let tick = self.tick;
        for state in self.fences.values_mut() {
            if let SimFence::Pending { complete_at } = *state {
                if complete_at < tick {
                    *state = SimFence::Signaled;
                }
            }
        }
        let fences = &self.fences;
        for cb in self.command_buffers.values_mut() {
            let still_pending = cb
                .in_flight
                .map_or(false, |fence| matches!(fences.get(&fence), Some(SimFence::Pending { .. })));
            if !still_pending {
                cb.in_flight = None;
            }
        }
    }

    fn pending_fences(&self) -> usize {
        self.fences
            .values()
            .filter(|f| matches!(f, SimFence::Pending { .. }))
            .count()
    }

    fn violation(&mut self, message: String) {
        log::error!("[sim] {}", message);
        self.violations.push(message);
    }
}

pub(crate) struct SimGpu {
    state: Mutex<SimState>,
}

impl SimGpu {
    /// GPU whose swapchains have `image_count` images and that finishes work
    /// immediately
    pub fn new(image_count: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                image_count,
                supported_present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                ..Default::default()
            }),
        }
    }

    /// Work completes only after `latency` further submissions
    pub fn with_latency(self, latency: u64) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn with_present_modes(self, modes: &[vk::PresentModeKHR]) -> Self {
        self.state.lock().supported_present_modes = modes.to_vec();
        self
    }

    /// Make the `call`-th acquire (1-based) fail with `result`
    pub fn inject_acquire(&self, call: usize, result: vk::Result) {
        self.state.lock().inject_acquire.insert(call, result);
    }

    /// Make the `call`-th present (1-based) fail with `result`
    pub fn inject_present(&self, call: usize, result: vk::Result) {
        self.state.lock().inject_present.insert(call, result);
    }

    pub fn set_image_count(&self, image_count: u32) {
        self.state.lock().image_count = image_count;
    }

    /// Pin the surface's current extent; `None` follows the request
    pub fn set_surface_extent(&self, extent: Option<vk::Extent2D>) {
        self.state.lock().surface_extent = extent;
    }

    pub fn barriers(&self) -> Vec<RecordedBarrier> {
        self.state.lock().barriers.clone()
    }

    pub fn barrier_calls(&self) -> usize {
        self.state.lock().barrier_calls
    }

    pub fn copies(&self) -> usize {
        self.state.lock().copies
    }

    pub fn presents(&self) -> Vec<u32> {
        self.state.lock().presents.clone()
    }

    pub fn swapchains_created(&self) -> usize {
        self.state.lock().swapchains_created
    }

    pub fn blocking_waits(&self) -> usize {
        self.state.lock().blocking_waits
    }

    pub fn max_pending_fences(&self) -> usize {
        self.state.lock().max_pending_fences
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn live_views(&self) -> usize {
        self.state.lock().views.len()
    }

    /// `(base mip, level count)` of a live view
    pub fn view_range(&self, view: vk::ImageView) -> Option<(u32, u32)> {
        self.state.lock().views.get(&view).copied()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn framebuffer_extents(&self) -> Vec<vk::Extent2D> {
        self.state.lock().framebuffers.values().copied().collect()
    }

    /// Semaphores signaled but never waited on
    pub fn dangling_signals(&self) -> usize {
        self.state.lock().semaphores.values().filter(|s| **s).count()
    }
}

impl CommandRecorder for SimGpu {
    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        let mut state = self.state.lock();
        state.barrier_calls += 1;
        for b in image_barriers {
            state.barriers.push(RecordedBarrier {
                cmd,
                image: b.image,
                src_stage,
                dst_stage,
                src_access: b.src_access_mask,
                dst_access: b.dst_access_mask,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                range: b.subresource_range,
            });
        }
    }

    fn copy_buffer_to_image(
        &self,
        _cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _image: vk::Image,
        layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.lock();
        if !state.buffers.contains(&buffer) {
            state.violation(format!("copy from unknown buffer {buffer:?}"));
        }
        if layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL && layout != vk::ImageLayout::GENERAL {
            state.violation(format!("copy into image in layout {layout:?}"));
        }
        state.copies += 1;
    }

    fn begin_render_pass(&self, _cmd: vk::CommandBuffer, info: &RenderPassInfo) {
        let mut state = self.state.lock();
        if !state.framebuffers.contains_key(&info.framebuffer) {
            state.violation(format!("render pass on destroyed framebuffer {:?}", info.framebuffer));
        }
    }

    fn end_render_pass(&self, _cmd: vk::CommandBuffer) {}
}

impl GpuBackend for SimGpu {
    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.handle());
        let initial = if signaled { SimFence::Signaled } else { SimFence::Unsignaled };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.advance();
        if matches!(state.fences.remove(&fence), Some(SimFence::Pending { .. })) {
            state.violation(format!("destroyed pending fence {fence:?}"));
        }
    }

    fn create_semaphore(&self) -> FrameResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> FrameResult<()> {
        let mut state = self.state.lock();
        state.advance();
        for fence in fences {
            match state.fences.get(fence).copied() {
                Some(SimFence::Signaled) => {}
                Some(SimFence::Pending { complete_at }) => {
                    // CPU stalls until the GPU gets there
                    state.blocking_waits += 1;
                    state.tick = state.tick.max(complete_at + 1);
                    state.advance();
                }
                Some(SimFence::Unsignaled) => {
                    state.violation(format!("wait on fence {fence:?} that nothing will signal"));
                    return Err(FrameError::Vulkan(vk::Result::TIMEOUT));
                }
                None => {
                    state.violation(format!("wait on unknown fence {fence:?}"));
                    return Err(FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
                }
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> FrameResult<()> {
        let mut state = self.state.lock();
        state.advance();
        for fence in fences {
            if matches!(state.fences.get(fence), Some(SimFence::Pending { .. })) {
                state.violation(format!("reset of pending fence {fence:?}"));
            }
            state.fences.insert(*fence, SimFence::Unsignaled);
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool> {
        let mut state = self.state.lock();
        state.advance();
        Ok(state.fences.get(&fence) == Some(&SimFence::Signaled))
    }

    fn allocate_command_buffers(&self, count: u32) -> FrameResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let buffers: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect();
        for cmd in &buffers {
            state.command_buffers.insert(*cmd, SimCommandBuffer::default());
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        state.advance();
        for cmd in buffers {
            if let Some(cb) = state.command_buffers.remove(cmd) {
                if cb.in_flight.is_some() {
                    state.violation(format!("freed in-flight command buffer {cmd:?}"));
                }
            }
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time_submit: bool) -> FrameResult<()> {
        let mut state = self.state.lock();
        state.advance();
        let in_flight = state.command_buffers.get(&cmd).map(|cb| cb.in_flight.is_some());
        match in_flight {
            Some(true) => state.violation(format!("re-recorded in-flight command buffer {cmd:?}")),
            Some(false) => {}
            None => state.violation(format!("begin on unknown command buffer {cmd:?}")),
        }
        let already_recording = state
            .command_buffers
            .get_mut(&cmd)
            .map_or(false, |cb| std::mem::replace(&mut cb.recording, true));
        if already_recording {
            state.violation(format!("begin on command buffer {cmd:?} that is still recording"));
        }
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        let mut state = self.state.lock();
        state.advance();
        let in_flight = state.command_buffers.get(&cmd).map(|cb| cb.in_flight.is_some());
        match in_flight {
            Some(true) => state.violation(format!("reset in-flight command buffer {cmd:?}")),
            Some(false) => {}
            None => state.violation(format!("reset of unknown command buffer {cmd:?}")),
        }
        if let Some(cb) = state.command_buffers.get_mut(&cmd) {
            cb.recording = false;
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        let mut state = self.state.lock();
        let was_recording = state
            .command_buffers
            .get_mut(&cmd)
            .map(|cb| std::mem::replace(&mut cb.recording, false));
        if was_recording != Some(true) {
            state.violation(format!("end on command buffer {cmd:?} that is not recording"));
        }
        Ok(())
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> FrameResult<()> {
        let mut state = self.state.lock();
        state.advance();

        for cmd in submission.command_buffers {
            let status = state.command_buffers.get(cmd).map(|cb| (cb.recording, cb.in_flight.is_some()));
            match status {
                Some((true, _)) => state.violation(format!("submitted {cmd:?} while recording")),
                Some((_, true)) => state.violation(format!("submitted {cmd:?} while still in flight")),
                Some(_) => {}
                None => state.violation(format!("submitted unknown command buffer {cmd:?}")),
            }
        }
        for semaphore in submission.wait_semaphores {
            if state.semaphores.insert(*semaphore, false) != Some(true) {
                state.violation(format!("wait on unsignaled semaphore {semaphore:?}"));
            }
        }
        for semaphore in submission.signal_semaphores {
            if state.semaphores.insert(*semaphore, true) == Some(true) {
                state.violation(format!("signal of already signaled semaphore {semaphore:?}"));
            }
        }

        if fence != vk::Fence::null() {
            if state.fences.get(&fence) != Some(&SimFence::Unsignaled) {
                state.violation(format!("submit with fence {fence:?} that is not reset"));
            }
            let complete_at = state.tick + state.latency;
            state.fences.insert(fence, SimFence::Pending { complete_at });
            for cmd in submission.command_buffers {
                if let Some(cb) = state.command_buffers.get_mut(cmd) {
                    cb.in_flight = Some(fence);
                }
            }
        }

        state.tick += 1;
        state.advance();
        let pending = state.pending_fences();
        state.max_pending_fences = state.max_pending_fences.max(pending);
        Ok(())
    }

    fn wait_idle(&self) -> FrameResult<()> {
        let mut state = self.state.lock();
        let last = state
            .fences
            .values()
            .filter_map(|f| match f {
                SimFence::Pending { complete_at } => Some(*complete_at),
                _ => None,
            })
            .max();
        if let Some(last) = last {
            state.tick = state.tick.max(last + 1);
        }
        state.advance();
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.acquire_calls += 1;
        let call = state.acquire_calls;

        let injected = state.inject_acquire.remove(&call);
        if let Some(result) = injected {
            if result != vk::Result::SUBOPTIMAL_KHR {
                return Err(result);
            }
        }

        if state.semaphores.insert(semaphore, true) != Some(false) {
            state.violation(format!("acquire signals busy semaphore {semaphore:?}"));
        }

        let Some(chain) = state.swapchains.get_mut(&swapchain) else {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };
        let index = chain.next as u32;
        chain.next = (chain.next + 1) % chain.images.len();
        Ok((index, injected == Some(vk::Result::SUBOPTIMAL_KHR)))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.present_calls += 1;
        let call = state.present_calls;

        for semaphore in wait_semaphores {
            if state.semaphores.insert(*semaphore, false) != Some(true) {
                state.violation(format!("present waits on unsignaled semaphore {semaphore:?}"));
            }
        }
        if !state.swapchains.contains_key(&swapchain) {
            state.violation(format!("present on unknown swapchain {swapchain:?}"));
        }

        match state.inject_present.remove(&call) {
            Some(vk::Result::SUBOPTIMAL_KHR) => {
                state.presents.push(image_index);
                Ok(true)
            }
            Some(result) => Err(result),
            None => {
                state.presents.push(image_index);
                Ok(false)
            }
        }
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> FrameResult<SwapchainImages> {
        let mut state = self.state.lock();
        let present_mode = super::swapchain::choose_present_mode(
            &state.supported_present_modes,
            desc.present_mode,
            desc.strict_present_mode,
        )?;
        log::debug!("[sim] swapchain with {:?}", present_mode);

        let extent = state.surface_extent.unwrap_or(desc.extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(FrameError::ZeroExtent);
        }

        if old_swapchain != vk::SwapchainKHR::null() && !state.swapchains.contains_key(&old_swapchain) {
            state.violation(format!("old swapchain {old_swapchain:?} already destroyed"));
        }

        let handle = vk::SwapchainKHR::from_raw(state.handle());
        let images: Vec<_> = (0..state.image_count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();
        state.swapchains.insert(handle, SimSwapchain { images: images.clone(), next: 0 });
        state.swapchains_created += 1;

        Ok(SwapchainImages {
            handle,
            images,
            format: vk::Format::B8G8R8A8_SRGB,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        if state.swapchains.remove(&swapchain).is_none() {
            state.violation(format!("destroyed unknown swapchain {swapchain:?}"));
        }
    }

    fn create_image_view(
        &self,
        _image: &GpuImage,
        base_mip_level: u32,
        level_count: u32,
    ) -> FrameResult<vk::ImageView> {
        let mut state = self.state.lock();
        let view = vk::ImageView::from_raw(state.handle());
        state.views.insert(view, (base_mip_level, level_count));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.views.remove(&view).is_none() {
            state.violation(format!("destroyed unknown view {view:?}"));
        }
    }

    fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        mip_levels: u32,
        _usage: vk::ImageUsageFlags,
    ) -> FrameResult<GpuImage> {
        let mut state = self.state.lock();
        let handle = vk::Image::from_raw(state.handle());
        state.images.insert(handle);
        Ok(GpuImage::new(
            handle,
            format,
            vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
            mip_levels,
            1,
            LayoutKind::Undefined,
        ))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        if !state.images.remove(&image) {
            state.violation(format!("destroyed unknown image {image:?}"));
        }
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> FrameResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        for view in attachments {
            if !state.views.contains_key(view) {
                state.violation(format!("framebuffer uses unknown view {view:?}"));
            }
        }
        let framebuffer = vk::Framebuffer::from_raw(state.handle());
        state.framebuffers.insert(framebuffer, extent);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn create_staging_buffer(&self, _data: &[u8]) -> FrameResult<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(buffer);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer);
    }
}
