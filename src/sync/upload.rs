// Staging uploads
//
// Decoders hand over bytes; they land in a staging buffer and get copied
// into the destination image. Both layout changes go through the tracker.

use ash::vk;

use super::image::GpuImage;
use super::layout::LayoutKind;
use crate::backend::CommandRecorder;
use crate::error::FrameResult;

/// Record a full copy of `staging` into mip 0 of `image`, leaving the image
/// ready for sampling. Previous contents are discarded.
pub fn record_image_upload<R: CommandRecorder + ?Sized>(
    recorder: &R,
    cmd: vk::CommandBuffer,
    staging: vk::Buffer,
    image: &mut GpuImage,
) -> FrameResult<()> {
    image.set_layout_discarding(recorder, cmd, LayoutKind::TransferDst, None)?;

    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0) // Tightly packed
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: image.aspect(),
            mip_level: 0,
            base_array_layer: 0,
            layer_count: image.array_layers(),
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(image.extent())
        .build();

    recorder.copy_buffer_to_image(
        cmd,
        staging,
        image.handle(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );

    image.set_layout(recorder, cmd, LayoutKind::ShaderReadOnly, None)?;
    Ok(())
}
