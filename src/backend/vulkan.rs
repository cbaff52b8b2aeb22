// Vulkan backend
//
// `GpuBackend` on top of ash. Owns the command pool, the surface and the
// allocations behind images and staging buffers created through it.

use std::collections::HashMap;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::{
    swapchain, CommandRecorder, GpuBackend, RenderPassInfo, Submission, SwapchainDesc, SwapchainImages,
    VulkanDevice,
};
use crate::error::{FrameError, FrameResult};
use crate::sync::{GpuImage, LayoutKind};

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    surface: vk::SurfaceKHR,
    swapchain_loader: ash::extensions::khr::Swapchain,
    command_pool: vk::CommandPool,
    image_allocations: Mutex<HashMap<vk::Image, Allocation>>,
    buffer_allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
}

impl VulkanBackend {
    /// Takes ownership of `surface`; it is destroyed with the backend
    pub fn new(device: Arc<VulkanDevice>, surface: vk::SurfaceKHR) -> FrameResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // RESET: slots re-record buffers individually
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        Ok(Self {
            device,
            surface,
            swapchain_loader,
            command_pool,
            image_allocations: Mutex::new(HashMap::new()),
            buffer_allocations: Mutex::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    fn raw(&self) -> &ash::Device {
        &self.device.device
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.device.allocator.lock().free(allocation) {
            log::error!("Failed to free GPU allocation: {}", e);
        }
    }
}

impl CommandRecorder for VulkanBackend {
    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.raw().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[], // Memory barriers
                &[], // Buffer barriers
                image_barriers,
            );
        }
    }

    fn copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.raw().cmd_copy_buffer_to_image(cmd, buffer, image, layout, regions);
        }
    }

    fn begin_render_pass(&self, cmd: vk::CommandBuffer, info: &RenderPassInfo) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(info.render_pass)
            .framebuffer(info.framebuffer)
            .render_area(info.render_area)
            .clear_values(&info.clear_values);
        unsafe {
            self.raw().cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    fn end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.raw().cmd_end_render_pass(cmd) };
    }
}

impl GpuBackend for VulkanBackend {
    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.raw().create_fence(&fence_info, None) }?)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.raw().destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> FrameResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { self.raw().create_semaphore(&semaphore_info, None) }?)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.raw().destroy_semaphore(semaphore, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> FrameResult<()> {
        unsafe { self.raw().wait_for_fences(fences, true, timeout_ns) }?;
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> FrameResult<()> {
        unsafe { self.raw().reset_fences(fences) }?;
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool> {
        Ok(unsafe { self.raw().get_fence_status(fence) }?)
    }

    fn allocate_command_buffers(&self, count: u32) -> FrameResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.raw().allocate_command_buffers(&alloc_info) }?)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        unsafe { self.raw().free_command_buffers(self.command_pool, buffers) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> FrameResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.raw().begin_command_buffer(cmd, &begin_info) }?;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        unsafe { self.raw().end_command_buffer(cmd) }?;
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        unsafe {
            self.raw()
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }?;
        Ok(())
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> FrameResult<()> {
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores)
            .build();
        unsafe {
            self.raw()
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
        }?;
        Ok(())
    }

    fn wait_idle(&self) -> FrameResult<()> {
        unsafe { self.raw().device_wait_idle() }?;
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.device.graphics_queue, &present_info)
        }
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> FrameResult<SwapchainImages> {
        swapchain::create_swapchain(
            &self.device,
            &self.swapchain_loader,
            self.surface,
            desc,
            old_swapchain,
        )
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn create_image_view(
        &self,
        image: &GpuImage,
        base_mip_level: u32,
        level_count: u32,
    ) -> FrameResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image.handle())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(image.format())
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: image.aspect(),
                base_mip_level,
                level_count,
                base_array_layer: 0,
                layer_count: 1,
            });

        Ok(unsafe { self.raw().create_image_view(&create_info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.raw().destroy_image_view(view, None) };
    }

    fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        mip_levels: u32,
        usage: vk::ImageUsageFlags,
    ) -> FrameResult<GpuImage> {
        let extent3d = vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent3d)
            .mip_levels(mip_levels.max(1))
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.raw().create_image(&create_info, None) }?;
        let requirements = unsafe { self.raw().get_image_memory_requirements(image) };

        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "frame image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.raw().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe {
            self.raw()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            unsafe { self.raw().destroy_image(image, None) };
            return Err(e.into());
        }
        self.image_allocations.lock().insert(image, allocation);

        Ok(GpuImage::new(image, format, extent3d, mip_levels, 1, LayoutKind::Undefined))
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.raw().destroy_image(image, None) };
        if let Some(allocation) = self.image_allocations.lock().remove(&image) {
            self.free_allocation(allocation);
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> FrameResult<vk::Framebuffer> {
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        Ok(unsafe { self.raw().create_framebuffer(&framebuffer_info, None) }?)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.raw().destroy_framebuffer(framebuffer, None) };
    }

    fn create_staging_buffer(&self, data: &[u8]) -> FrameResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(data.len().max(1) as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.raw().create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.raw().get_buffer_memory_requirements(buffer) };

        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "staging",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let mut allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.raw().destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            self.raw()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let written = match (bound, allocation.mapped_slice_mut()) {
            (Ok(()), Some(mapped)) => {
                mapped[..data.len()].copy_from_slice(data);
                Ok(())
            }
            (Ok(()), None) => Err(FrameError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED)),
            (Err(e), _) => Err(FrameError::Vulkan(e)),
        };
        if let Err(e) = written {
            self.free_allocation(allocation);
            unsafe { self.raw().destroy_buffer(buffer, None) };
            return Err(e);
        }

        self.buffer_allocations.lock().insert(buffer, allocation);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.raw().destroy_buffer(buffer, None) };
        if let Some(allocation) = self.buffer_allocations.lock().remove(&buffer) {
            self.free_allocation(allocation);
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();

        let images: Vec<_> = self.image_allocations.lock().drain().collect();
        for (image, allocation) in images {
            log::warn!("Image {:?} still alive at backend teardown", image);
            unsafe { self.raw().destroy_image(image, None) };
            self.free_allocation(allocation);
        }
        let buffers: Vec<_> = self.buffer_allocations.lock().drain().collect();
        for (buffer, allocation) in buffers {
            unsafe { self.raw().destroy_buffer(buffer, None) };
            self.free_allocation(allocation);
        }

        unsafe {
            self.raw().destroy_command_pool(self.command_pool, None);
            self.device.surface_loader.destroy_surface(self.surface, None);
        }
        log::info!("Vulkan backend destroyed");
    }
}
