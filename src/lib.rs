// =============================================================================
// FRAME PACER - GPU frame synchronization for Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  FramePacer (acquire -> record -> submit -> present)            │
// │    ├── FrameSlotManager (fences + command buffers per image)    │
// │    ├── SwapchainLifecycle (swapchain, depth, framebuffers)      │
// │    └── caller callbacks                                         │
// │          └── GpuImage / BarrierBatcher (tracked layouts)        │
// │  backend::GpuBackend (ash, or the simulated GPU in tests)       │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod sync;

pub use backend::{CommandRecorder, GpuBackend, RenderPassInfo, SwapchainDesc};
pub use error::{FrameError, FrameResult};
pub use frame::{FramePacer, FrameStatus, PacerConfig};
pub use sync::{set_layout, AccessKind, BarrierBatcher, GpuImage, LayoutKind};
