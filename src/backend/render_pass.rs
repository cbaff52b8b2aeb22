// Render pass and framebuffers
//
// A plain config struct is validated, then turned into one render pass
// with a color and a depth attachment in a single subpass.

use ash::vk;

use super::GpuBackend;
use crate::error::{FrameError, FrameResult};
use crate::sync::{aspect_for_format, LayoutKind};

#[derive(Debug, Clone, Copy)]
pub struct RenderPassConfig {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    /// CLEAR for a fresh frame, LOAD to draw over earlier passes
    pub color_load_op: vk::AttachmentLoadOp,
    /// Layout the color attachment is left in
    pub color_final_layout: LayoutKind,
    /// Keep depth contents after the pass
    pub store_depth: bool,
}

impl RenderPassConfig {
    /// Presentable color + transient depth
    pub fn present(color_format: vk::Format, depth_format: vk::Format) -> Self {
        Self {
            color_format,
            depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            color_load_op: vk::AttachmentLoadOp::CLEAR,
            color_final_layout: LayoutKind::Present,
            store_depth: false,
        }
    }

    /// Checks run in a fixed order; the first failure is reported
    pub fn validate(&self) -> FrameResult<()> {
        if self.color_format == vk::Format::UNDEFINED {
            return Err(FrameError::InvalidRenderPass("color format is not set"));
        }
        if !aspect_for_format(self.depth_format).contains(vk::ImageAspectFlags::DEPTH) {
            return Err(FrameError::InvalidRenderPass("depth format has no depth aspect"));
        }
        if self.samples.as_raw().count_ones() != 1 {
            return Err(FrameError::InvalidRenderPass("sample count must be a single value"));
        }
        if !self.color_final_layout.is_valid_target() || self.color_final_layout.needs_access_kind() {
            return Err(FrameError::InvalidRenderPass("color final layout cannot be entered by a render pass"));
        }
        Ok(())
    }

    fn attachments(&self) -> [vk::AttachmentDescription; 2] {
        let color_initial = if self.color_load_op == vk::AttachmentLoadOp::LOAD {
            self.color_final_layout.to_vk()
        } else {
            vk::ImageLayout::UNDEFINED
        };

        let color = vk::AttachmentDescription::builder()
            .format(self.color_format)
            .samples(self.samples)
            .load_op(self.color_load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(color_initial)
            .final_layout(self.color_final_layout.to_vk())
            .build();

        let depth_store = if self.store_depth {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        };
        let depth = vk::AttachmentDescription::builder()
            .format(self.depth_format)
            .samples(self.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(depth_store)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        [color, depth]
    }

    /// External dependency: earlier frames' attachment writes (the depth
    /// image is shared) and the acquire wait come before this pass
    fn dependency(&self) -> vk::SubpassDependency {
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()
    }
}

/// Validate `config` and create the render pass
pub fn create_render_pass(device: &ash::Device, config: &RenderPassConfig) -> FrameResult<vk::RenderPass> {
    config.validate()?;

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .depth_stencil_attachment(&depth_ref)
        .build();

    let attachments = config.attachments();
    let subpasses = [subpass];
    let dependencies = [config.dependency()];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }?;
    log::info!(
        "Created render pass: {:?} + {:?} -> {:?}",
        config.color_format,
        config.depth_format,
        config.color_final_layout
    );
    Ok(render_pass)
}

/// One framebuffer per color view, all sharing `depth_view`.
/// Nothing is leaked if a later framebuffer fails.
pub fn create_framebuffers<B: GpuBackend + ?Sized>(
    backend: &B,
    render_pass: vk::RenderPass,
    color_views: &[vk::ImageView],
    depth_view: vk::ImageView,
    extent: vk::Extent2D,
) -> FrameResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(color_views.len());
    for &view in color_views {
        match backend.create_framebuffer(render_pass, &[view, depth_view], extent) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    backend.destroy_framebuffer(framebuffer);
                }
                return Err(e);
            }
        }
    }
    Ok(framebuffers)
}
