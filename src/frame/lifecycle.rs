// Swapchain lifecycle
//
// Owns everything whose size follows the surface: the swapchain, its image
// views, the depth image and one framebuffer per image. A rebuild is all or
// nothing; any failure here is fatal to the caller.

use ash::vk;

use super::slots::FrameSlotManager;
use crate::backend::{render_pass, GpuBackend, RenderPassInfo, SwapchainDesc};
use crate::error::{FrameError, FrameResult};
use crate::sync::{GpuImage, LayoutKind};

/// Size-dependent render targets of one swapchain build
pub struct SwapchainTargets {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<GpuImage>,
    pub depth: GpuImage,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

pub struct SwapchainLifecycle {
    render_pass: vk::RenderPass,
    desc: SwapchainDesc,
    targets: Option<SwapchainTargets>,
}

impl SwapchainLifecycle {
    pub fn new<B: GpuBackend + ?Sized>(
        backend: &B,
        render_pass: vk::RenderPass,
        desc: SwapchainDesc,
    ) -> FrameResult<Self> {
        let targets = Self::build(backend, render_pass, &desc, vk::SwapchainKHR::null())?;
        Ok(Self { render_pass, desc, targets: Some(targets) })
    }

    fn targets(&self) -> FrameResult<&SwapchainTargets> {
        self.targets.as_ref().ok_or(FrameError::TargetsMissing)
    }

    pub fn swapchain(&self) -> FrameResult<vk::SwapchainKHR> {
        Ok(self.targets()?.swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.targets.as_ref().map_or(0, |t| t.images.len())
    }

    /// Extent of the current build, or the requested one if torn down
    pub fn extent(&self) -> vk::Extent2D {
        self.targets.as_ref().map_or(self.desc.extent, |t| t.extent)
    }

    pub fn format(&self) -> Option<vk::Format> {
        self.targets.as_ref().map(|t| t.format)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn image(&self, index: usize) -> Option<&GpuImage> {
        self.targets.as_ref().and_then(|t| t.images.get(index))
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        match &self.targets {
            Some(targets) => &targets.framebuffers,
            None => &[],
        }
    }

    /// Begin info for the render pass drawing into image `index`
    pub fn render_pass_info(&self, index: usize, clear_color: [f32; 4]) -> FrameResult<RenderPassInfo> {
        let targets = self.targets()?;
        let framebuffer = *targets.framebuffers.get(index).ok_or(FrameError::SlotOutOfRange {
            index,
            count: targets.framebuffers.len(),
        })?;

        Ok(RenderPassInfo {
            render_pass: self.render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: targets.extent,
            },
            clear_values: [
                vk::ClearValue {
                    color: vk::ClearColorValue { float32: clear_color },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                },
            ],
        })
    }

    /// The render pass leaves its color attachment ready for presentation
    pub(crate) fn mark_presentable(&mut self, index: usize) {
        if let Some(image) = self.targets.as_mut().and_then(|t| t.images.get_mut(index)) {
            image.commit_layout(LayoutKind::Present, None);
        }
    }

    /// Rebuild every target for `extent`.
    ///
    /// Order: drain in-flight work, drop old views/depth/framebuffers,
    /// create the swapchain from the old one, views, depth, framebuffers,
    /// then retire the old swapchain and resize the slot set.
    ///
    /// Returns `false` when the surface has no area. Everything stays torn
    /// down until a later call succeeds.
    pub fn recreate<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &B,
        slots: &mut FrameSlotManager,
        extent: vk::Extent2D,
    ) -> FrameResult<bool> {
        log::info!("Recreating swapchain at {}x{}", extent.width, extent.height);
        slots.wait_all(backend)?;

        let old_swapchain = match self.targets.take() {
            Some(mut old) => {
                Self::destroy_size_dependent(backend, &mut old);
                old.swapchain
            }
            None => vk::SwapchainKHR::null(),
        };

        self.desc.extent = extent;
        let built = Self::build(backend, self.render_pass, &self.desc, old_swapchain);
        if old_swapchain != vk::SwapchainKHR::null() {
            backend.destroy_swapchain(old_swapchain);
        }

        let targets = match built {
            Ok(targets) => targets,
            Err(FrameError::ZeroExtent) => {
                log::debug!("Surface is zero-sized, swapchain left torn down");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let count = targets.images.len();
        self.targets = Some(targets);
        slots.rebuild(backend, count)?;
        Ok(true)
    }

    /// Whether swapchain targets currently exist
    pub fn is_built(&self) -> bool {
        self.targets.is_some()
    }

    fn build<B: GpuBackend + ?Sized>(
        backend: &B,
        render_pass: vk::RenderPass,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> FrameResult<SwapchainTargets> {
        let raw = backend.create_swapchain(desc, old_swapchain)?;
        let extent3d = vk::Extent3D {
            width: raw.extent.width,
            height: raw.extent.height,
            depth: 1,
        };

        let mut images = Vec::with_capacity(raw.images.len());
        for handle in &raw.images {
            let mut image = GpuImage::new(*handle, raw.format, extent3d, 1, 1, LayoutKind::Undefined);
            image.ensure_mip_views(backend)?;
            images.push(image);
        }

        let mut depth = backend.create_image(
            desc.depth_format,
            raw.extent,
            1,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        depth.ensure_mip_views(backend)?;
        let depth_view = depth.mip_view(0).ok_or(FrameError::TargetsMissing)?;

        let color_views = images
            .iter()
            .map(|image| image.mip_view(0).ok_or(FrameError::TargetsMissing))
            .collect::<FrameResult<Vec<_>>>()?;
        let framebuffers =
            render_pass::create_framebuffers(backend, render_pass, &color_views, depth_view, raw.extent)?;

        log::info!(
            "Swapchain built: {} images, {}x{}, {:?}",
            images.len(),
            raw.extent.width,
            raw.extent.height,
            raw.format
        );

        Ok(SwapchainTargets {
            swapchain: raw.handle,
            images,
            depth,
            framebuffers,
            extent: raw.extent,
            format: raw.format,
        })
    }

    /// Everything but the swapchain handle itself
    fn destroy_size_dependent<B: GpuBackend + ?Sized>(backend: &B, targets: &mut SwapchainTargets) {
        for framebuffer in targets.framebuffers.drain(..) {
            backend.destroy_framebuffer(framebuffer);
        }
        for image in &mut targets.images {
            image.destroy_views(backend);
        }
        targets.depth.destroy_views(backend);
        backend.destroy_image(targets.depth.handle());
    }

    /// Tear everything down. The caller makes sure the device is idle.
    pub fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &B) {
        if let Some(mut targets) = self.targets.take() {
            Self::destroy_size_dependent(backend, &mut targets);
            backend.destroy_swapchain(targets.swapchain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimGpu;
    use crate::frame::BufferRole;
    use ash::vk::Handle;

    fn desc(width: u32, height: u32) -> SwapchainDesc {
        SwapchainDesc {
            extent: vk::Extent2D { width, height },
            present_mode: vk::PresentModeKHR::FIFO,
            strict_present_mode: false,
            depth_format: vk::Format::D32_SFLOAT,
        }
    }

    fn render_pass() -> vk::RenderPass {
        vk::RenderPass::from_raw(0xAA)
    }

    #[test]
    fn test_initial_build() {
        let gpu = SimGpu::new(3);
        let lifecycle = SwapchainLifecycle::new(&gpu, render_pass(), desc(800, 600)).unwrap();

        assert_eq!(lifecycle.image_count(), 3);
        assert_eq!(lifecycle.framebuffers().len(), 3);
        // One view per swapchain image plus the depth view
        assert_eq!(gpu.live_views(), 4);
        assert_eq!(lifecycle.image(0).unwrap().layout(), LayoutKind::Undefined);
    }

    #[test]
    fn test_recreate_matches_new_extent() {
        let gpu = SimGpu::new(2);
        let mut lifecycle = SwapchainLifecycle::new(&gpu, render_pass(), desc(800, 600)).unwrap();
        let mut slots = FrameSlotManager::new(&gpu, 2, u64::MAX).unwrap();
        let old = lifecycle.swapchain().unwrap();

        let built = lifecycle
            .recreate(&gpu, &mut slots, vk::Extent2D { width: 1024, height: 768 })
            .unwrap();
        assert!(built);

        assert_ne!(lifecycle.swapchain().unwrap(), old);
        assert_eq!(gpu.live_swapchains(), 1);
        assert_eq!(gpu.live_views(), 3);
        let extents = gpu.framebuffer_extents();
        assert_eq!(extents.len(), 2);
        assert!(extents.iter().all(|e| e.width == 1024 && e.height == 768));
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_recreate_follows_image_count() {
        let gpu = SimGpu::new(2);
        let mut lifecycle = SwapchainLifecycle::new(&gpu, render_pass(), desc(800, 600)).unwrap();
        let mut slots = FrameSlotManager::new(&gpu, 2, u64::MAX).unwrap();

        gpu.set_image_count(3);
        lifecycle.recreate(&gpu, &mut slots, lifecycle.extent()).unwrap();

        assert_eq!(lifecycle.image_count(), 3);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots.slot(2).unwrap().fence_state(BufferRole::Static), crate::frame::FenceState::Signaled);
    }

    #[test]
    fn test_zero_sized_surface_leaves_targets_torn_down() {
        let gpu = SimGpu::new(2);
        let mut lifecycle = SwapchainLifecycle::new(&gpu, render_pass(), desc(800, 600)).unwrap();
        let mut slots = FrameSlotManager::new(&gpu, 2, u64::MAX).unwrap();

        gpu.set_surface_extent(Some(vk::Extent2D { width: 0, height: 0 }));
        assert!(!lifecycle.recreate(&gpu, &mut slots, lifecycle.extent()).unwrap());

        assert!(!lifecycle.is_built());
        assert_eq!(gpu.live_swapchains(), 0);
        assert_eq!(gpu.live_views(), 0);
        assert!(gpu.framebuffer_extents().is_empty());

        gpu.set_surface_extent(None);
        assert!(lifecycle.recreate(&gpu, &mut slots, lifecycle.extent()).unwrap());
        assert!(lifecycle.is_built());
        assert_eq!(lifecycle.extent().width, 800);
        assert_eq!(gpu.live_swapchains(), 1);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_missing_strict_present_mode_is_fatal() {
        let gpu = SimGpu::new(2).with_present_modes(&[vk::PresentModeKHR::FIFO]);
        let mut wanted = desc(800, 600);
        wanted.present_mode = vk::PresentModeKHR::MAILBOX;
        wanted.strict_present_mode = true;

        let result = SwapchainLifecycle::new(&gpu, render_pass(), wanted);
        assert!(matches!(
            result,
            Err(FrameError::PresentModeUnsupported(vk::PresentModeKHR::MAILBOX))
        ));
    }

    #[test]
    fn test_render_pass_info() {
        let gpu = SimGpu::new(2);
        let lifecycle = SwapchainLifecycle::new(&gpu, render_pass(), desc(320, 240)).unwrap();

        let info = lifecycle.render_pass_info(1, [0.1, 0.2, 0.3, 1.0]).unwrap();
        assert_eq!(info.framebuffer, lifecycle.framebuffers()[1]);
        assert_eq!(info.render_area.extent.width, 320);
        assert!(lifecycle.render_pass_info(2, [0.0; 4]).is_err());
    }

    #[test]
    fn test_destroy_releases_everything() {
        let gpu = SimGpu::new(2);
        let mut lifecycle = SwapchainLifecycle::new(&gpu, render_pass(), desc(800, 600)).unwrap();

        lifecycle.destroy(&gpu);

        assert_eq!(gpu.live_views(), 0);
        assert_eq!(gpu.live_swapchains(), 0);
        assert!(gpu.framebuffer_extents().is_empty());
        assert!(matches!(lifecycle.swapchain(), Err(FrameError::TargetsMissing)));
    }
}
