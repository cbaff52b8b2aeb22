// Tracked GPU images
//
// `GpuImage` owns its layout state. The type is deliberately not `Clone`:
// one image value, one tracker, so the tracked layout cannot drift from the
// barriers actually recorded for it. Layout changes need `&mut`, which keeps
// them on the single thread recording for the image.

use ash::vk;

use super::layout::{AccessKind, LayoutKind, LayoutTransition};
use crate::backend::{CommandRecorder, GpuBackend};
use crate::error::FrameResult;

/// Per-image layout + access state
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceStateTracker {
    layout: LayoutKind,
    access: Option<AccessKind>,
}

impl ResourceStateTracker {
    pub fn new(layout: LayoutKind) -> Self {
        Self { layout, access: None }
    }

    pub fn layout(&self) -> LayoutKind {
        self.layout
    }

    pub fn access(&self) -> Option<AccessKind> {
        self.access
    }

    /// Work out the barrier for moving to `layout`, or `None` when the image
    /// is already there with the same access direction.
    pub fn plan(
        &self,
        layout: LayoutKind,
        access: Option<AccessKind>,
        discard: bool,
    ) -> FrameResult<Option<LayoutTransition>> {
        let access = normalize(layout, access);
        if layout == self.layout && access == self.access {
            return Ok(None);
        }
        LayoutTransition::derive(self.layout, self.access, layout, access, discard).map(Some)
    }

    fn commit(&mut self, layout: LayoutKind, access: Option<AccessKind>) {
        self.layout = layout;
        self.access = normalize(layout, access);
    }
}

/// Access hints only mean something for the general layout
fn normalize(layout: LayoutKind, access: Option<AccessKind>) -> Option<AccessKind> {
    if layout.needs_access_kind() {
        access
    } else {
        None
    }
}

/// Image aspect implied by a format
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// GPU image with tracked layout and views.
///
/// `mip_view(level)` covers exactly that one level, for render targets and
/// per-level writes. Sampling the whole chain goes through `sampled_view`,
/// a separate view that only exists for images with more than one level.
pub struct GpuImage {
    handle: vk::Image,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    state: ResourceStateTracker,
    /// Indexed by mip level; empty until `ensure_mip_views`
    views: Vec<vk::ImageView>,
    /// Whole mip chain; `None` for single-level images
    chain_view: Option<vk::ImageView>,
}

impl GpuImage {
    pub fn new(
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        initial_layout: LayoutKind,
    ) -> Self {
        Self {
            handle,
            format,
            extent,
            mip_levels: mip_levels.max(1),
            array_layers: array_layers.max(1),
            state: ResourceStateTracker::new(initial_layout),
            views: Vec::new(),
            chain_view: None,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    pub fn layout(&self) -> LayoutKind {
        self.state.layout()
    }

    pub fn state(&self) -> &ResourceStateTracker {
        &self.state
    }

    /// Range covering every mip and layer
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// View of a single mip level, if created
    pub fn mip_view(&self, level: u32) -> Option<vk::ImageView> {
        self.views.get(level as usize).copied()
    }

    /// View over every mip level
    pub fn sampled_view(&self) -> Option<vk::ImageView> {
        self.chain_view.or_else(|| self.mip_view(0))
    }

    /// Create one single-level view per mip, plus the chain view
    pub fn ensure_mip_views<B: GpuBackend + ?Sized>(&mut self, backend: &B) -> FrameResult<()> {
        while (self.views.len() as u32) < self.mip_levels {
            let level = self.views.len() as u32;
            let view = backend.create_image_view(self, level, 1)?;
            self.views.push(view);
        }
        if self.mip_levels > 1 && self.chain_view.is_none() {
            self.chain_view = Some(backend.create_image_view(self, 0, self.mip_levels)?);
        }
        Ok(())
    }

    pub fn destroy_views<B: GpuBackend + ?Sized>(&mut self, backend: &B) {
        for view in self.views.drain(..).chain(self.chain_view.take()) {
            backend.destroy_image_view(view);
        }
    }

    /// Barrier for this image from a derived transition
    pub fn barrier(&self, transition: &LayoutTransition) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(transition.src.access)
            .dst_access_mask(transition.dst.access)
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(self.full_range())
            .build()
    }

    /// Move the image to `layout`, recording one barrier into `cmd`.
    ///
    /// Returns `false` without recording anything when the image is already
    /// in `layout` with the same access kind.
    pub fn set_layout<R: CommandRecorder + ?Sized>(
        &mut self,
        recorder: &R,
        cmd: vk::CommandBuffer,
        layout: LayoutKind,
        access: Option<AccessKind>,
    ) -> FrameResult<bool> {
        self.transition(recorder, cmd, layout, access, false)
    }

    /// Same as `set_layout`, but the current contents are don't-care
    /// (first write to a transient attachment).
    pub fn set_layout_discarding<R: CommandRecorder + ?Sized>(
        &mut self,
        recorder: &R,
        cmd: vk::CommandBuffer,
        layout: LayoutKind,
        access: Option<AccessKind>,
    ) -> FrameResult<bool> {
        self.transition(recorder, cmd, layout, access, true)
    }

    fn transition<R: CommandRecorder + ?Sized>(
        &mut self,
        recorder: &R,
        cmd: vk::CommandBuffer,
        layout: LayoutKind,
        access: Option<AccessKind>,
        discard: bool,
    ) -> FrameResult<bool> {
        let Some(transition) = self.state.plan(layout, access, discard)? else {
            return Ok(false);
        };

        let barrier = self.barrier(&transition);
        recorder.pipeline_barrier(cmd, transition.src.stages, transition.dst.stages, &[barrier]);
        self.state.commit(layout, access);
        Ok(true)
    }

    /// Record that the image is in `layout` without emitting a barrier.
    pub(crate) fn commit_layout(&mut self, layout: LayoutKind, access: Option<AccessKind>) {
        self.state.commit(layout, access);
    }

    /// Overwrite the tracked state without emitting a barrier.
    ///
    /// # Sharp edge
    ///
    /// Meant for command buffers recorded out of band that moved the image
    /// themselves. Nothing checks that the claim is true: a wrong value makes
    /// the next `set_layout` emit a barrier for a transition that never
    /// happened.
    pub fn force_layout(&mut self, layout: LayoutKind, access: Option<AccessKind>) {
        log::debug!(
            "Forcing tracked layout of {:?}: {:?} -> {:?}",
            self.handle,
            self.state.layout(),
            layout
        );
        self.state.commit(layout, access);
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("layout", &self.state.layout())
            .finish()
    }
}
