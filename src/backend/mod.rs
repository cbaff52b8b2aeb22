// Backend module - GPU access seam
//
// The frame core never calls ash directly. It goes through `CommandRecorder`
// (commands recorded into a buffer) and `GpuBackend` (object lifetimes,
// submission, presentation). `VulkanBackend` is the ash implementation.

pub mod device;
pub mod render_pass;
pub mod swapchain;
pub mod vulkan;

#[cfg(test)]
pub(crate) mod sim;

pub use device::VulkanDevice;
pub use render_pass::{create_framebuffers, create_render_pass, RenderPassConfig};
pub use vulkan::VulkanBackend;

use ash::prelude::VkResult;
use ash::vk;

use crate::error::FrameResult;
use crate::sync::GpuImage;

/// One queue submission
///
/// `wait_semaphores` and `wait_stages` are parallel slices.
pub struct Submission<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// What the swapchain should look like after (re)creation
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    /// Fail instead of falling back to FIFO when `present_mode` is missing
    pub strict_present_mode: bool,
    pub depth_format: vk::Format,
}

/// Raw swapchain as returned by the backend
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Everything needed to begin the render pass of one swapchain image
#[derive(Clone, Copy)]
pub struct RenderPassInfo {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: [vk::ClearValue; 2],
}

/// Commands recorded into a command buffer
pub trait CommandRecorder {
    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    );

    fn copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn begin_render_pass(&self, cmd: vk::CommandBuffer, info: &RenderPassInfo);

    fn end_render_pass(&self, cmd: vk::CommandBuffer);
}

/// Device-level operations the frame core relies on
pub trait GpuBackend: CommandRecorder {
    // Synchronization objects
    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> FrameResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> FrameResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> FrameResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool>;

    // Command buffers
    fn allocate_command_buffers(&self, count: u32) -> FrameResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> FrameResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;
    /// Drop whatever was recorded, from any state but pending
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;

    // Queue
    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> FrameResult<()>;
    fn wait_idle(&self) -> FrameResult<()>;

    // Presentation. These return raw results so the caller can tell
    // ERROR_OUT_OF_DATE_KHR apart from fatal errors.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;

    // Swapchain targets
    /// Fails with `FrameError::ZeroExtent` while the surface has no area
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> FrameResult<SwapchainImages>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn create_image_view(
        &self,
        image: &GpuImage,
        base_mip_level: u32,
        level_count: u32,
    ) -> FrameResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a device-local 2D image with memory bound
    fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        mip_levels: u32,
        usage: vk::ImageUsageFlags,
    ) -> FrameResult<GpuImage>;
    /// Release an image created by `create_image` and its memory
    fn destroy_image(&self, image: vk::Image);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> FrameResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Staging
    /// Host-visible buffer filled with `data`, usable as a transfer source
    fn create_staging_buffer(&self, data: &[u8]) -> FrameResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
}
