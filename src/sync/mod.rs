// Resource state tracking
//
// Layout lookup tables, tracked images, batched transitions and staging
// uploads. Everything records through `backend::CommandRecorder`.

pub mod batch;
pub mod image;
pub mod layout;
pub mod upload;

pub use batch::{BarrierBatcher, MAX_BATCHED_IMAGES};
pub use image::{aspect_for_format, GpuImage, ResourceStateTracker};
pub use layout::{AccessKind, LayoutKind, LayoutTransition, Scope, ACQUIRE_WAIT_STAGES};
pub use upload::record_image_upload;

use ash::vk;

use crate::backend::CommandRecorder;
use crate::error::FrameResult;

/// Free-function form of `GpuImage::set_layout` for code outside the pacer
pub fn set_layout<R: CommandRecorder + ?Sized>(
    recorder: &R,
    cmd: vk::CommandBuffer,
    image: &mut GpuImage,
    layout: LayoutKind,
    access: Option<AccessKind>,
) -> FrameResult<bool> {
    image.set_layout(recorder, cmd, layout, access)
}
