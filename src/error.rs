// Error types for the frame core
//
// Fatal conditions and caller contract violations are typed here.
// Swapchain staleness is NOT an error: it travels as `AcquireOutcome::Stale`
// or a present result and is absorbed by `FramePacer::draw`.

use ash::vk;
use thiserror::Error;

use crate::sync::LayoutKind;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// GPU allocator error (out of memory included)
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// The configured present mode is required but not offered by the surface
    #[error("Present mode {0:?} is not supported by the surface")]
    PresentModeUnsupported(vk::PresentModeKHR),

    /// The surface reports no present modes at all
    #[error("Surface offers no present modes")]
    NoPresentMode,

    /// The surface reports no formats
    #[error("No suitable surface format")]
    NoSurfaceFormat,

    /// General/storage layout used without saying read, write or both
    #[error("Layout {0:?} needs an explicit access kind")]
    MissingAccessKind(LayoutKind),

    /// UNDEFINED and PREINITIALIZED can only be left, never entered
    #[error("Cannot transition an image into layout {0:?}")]
    InvalidTargetLayout(LayoutKind),

    /// Too many images for a single batched barrier
    #[error("Batch of {count} images exceeds the limit of {limit}")]
    BatchTooLarge { count: usize, limit: usize },

    /// Recording into a command buffer whose fence has not signaled yet
    #[error("Command buffer of slot {slot} ({role:?}) is still in flight")]
    BufferInFlight { slot: usize, role: crate::frame::BufferRole },

    /// Submitting with a fence that was never reset since it last signaled
    #[error("Fence of slot {slot} ({role:?}) was not reset before submission")]
    FenceNotReset { slot: usize, role: crate::frame::BufferRole },

    /// Slot index outside of the swapchain image range
    #[error("Slot index {index} out of range ({count} slots)")]
    SlotOutOfRange { index: usize, count: usize },

    /// The surface is currently zero-sized (minimized window)
    #[error("Surface has a zero extent")]
    ZeroExtent,

    /// Swapchain targets are missing (shut down or never built)
    #[error("Swapchain targets are not built")]
    TargetsMissing,

    /// A caller-supplied recording callback failed
    #[error("Recording callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    /// Render pass configuration rejected before creation
    #[error("Invalid render pass config: {0}")]
    InvalidRenderPass(&'static str),
}

/// Result type alias for frame core operations
pub type FrameResult<T> = std::result::Result<T, FrameError>;
