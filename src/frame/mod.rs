// Frame pacing
//
// Slots guard command buffer reuse with fences, the lifecycle rebuilds
// swapchain targets, and the pacer drives one frame at a time through
// acquire -> dynamic submit -> static submit -> present.

pub mod lifecycle;
pub mod pacer;
pub mod slots;

pub use lifecycle::{SwapchainLifecycle, SwapchainTargets};
pub use pacer::{
    DynamicRecorder, FramePacer, FrameStats, FrameStatus, PacerConfig, PacerState, StaticRecorder,
};
pub use slots::{AcquireOutcome, FenceState, FrameSlot, FrameSlotManager};

/// Which of a slot's two command buffers an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Re-recorded every frame by the dynamic callback
    Dynamic,
    /// Recorded once per swapchain build, resubmitted every frame
    Static,
}
