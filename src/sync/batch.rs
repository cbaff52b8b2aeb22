// Batched layout transitions
//
// Several images heading to the same layout/access kind share the
// destination scope. Those whose old layout also needs the same source
// stages go into one `vkCmdPipelineBarrier`; the rest get their own.

use ash::vk;

use super::image::GpuImage;
use super::layout::{AccessKind, LayoutKind, LayoutTransition};
use crate::backend::CommandRecorder;
use crate::error::{FrameError, FrameResult};

/// Upper bound on images handed to one batched transition
pub const MAX_BATCHED_IMAGES: usize = 32;

pub struct BarrierBatcher;

impl BarrierBatcher {
    /// Move every image to `layout`/`access`.
    ///
    /// Returns how many images were covered by the shared barrier call.
    /// Images already in the target state are skipped and not counted.
    /// Validation happens before anything is recorded, so on error no image
    /// state changes.
    pub fn transition<R: CommandRecorder + ?Sized>(
        recorder: &R,
        cmd: vk::CommandBuffer,
        images: &mut [&mut GpuImage],
        layout: LayoutKind,
        access: Option<AccessKind>,
        discard: bool,
    ) -> FrameResult<usize> {
        if images.len() > MAX_BATCHED_IMAGES {
            return Err(FrameError::BatchTooLarge {
                count: images.len(),
                limit: MAX_BATCHED_IMAGES,
            });
        }

        let mut planned: Vec<(usize, LayoutTransition)> = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            if let Some(transition) = image.state().plan(layout, access, discard)? {
                planned.push((i, transition));
            }
        }
        if planned.is_empty() {
            return Ok(0);
        }

        let shared_src = Self::shared_source_stages(&planned);
        let dst_stages = planned[0].1.dst.stages;

        let batch: Vec<vk::ImageMemoryBarrier> = planned
            .iter()
            .filter(|(_, t)| t.src.stages == shared_src)
            .map(|(i, t)| images[*i].barrier(t))
            .collect();
        recorder.pipeline_barrier(cmd, shared_src, dst_stages, &batch);

        for (i, t) in planned.iter().filter(|(_, t)| t.src.stages != shared_src) {
            let barrier = images[*i].barrier(t);
            recorder.pipeline_barrier(cmd, t.src.stages, t.dst.stages, &[barrier]);
        }

        for (i, _) in &planned {
            images[*i].commit_layout(layout, access);
        }

        log::trace!(
            "Batched {} of {} transitions to {:?}",
            batch.len(),
            planned.len(),
            layout
        );
        Ok(batch.len())
    }

    /// Source stages needed by the most images; ties go to the first seen
    fn shared_source_stages(planned: &[(usize, LayoutTransition)]) -> vk::PipelineStageFlags {
        let mut counts: Vec<(vk::PipelineStageFlags, usize)> = Vec::new();
        for (_, t) in planned {
            match counts.iter_mut().find(|(stages, _)| *stages == t.src.stages) {
                Some((_, n)) => *n += 1,
                None => counts.push((t.src.stages, 1)),
            }
        }

        let mut best = counts[0];
        for entry in &counts[1..] {
            if entry.1 > best.1 {
                best = *entry;
            }
        }
        best.0
    }
}
