// Swapchain - Window presentation
//
// Surface queries and swapchain creation. The choices (format, present
// mode, extent, image count) are plain functions so they can be checked
// without a GPU.

use ash::vk;

use super::{SwapchainDesc, SwapchainImages, VulkanDevice};
use crate::error::{FrameError, FrameResult};

/// Prefer SRGB BGRA, otherwise take whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> FrameResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or(FrameError::NoSurfaceFormat)
}

/// Pick `wanted` if the surface offers it.
///
/// Otherwise fall back to FIFO, which every surface must support, unless
/// `strict` asks for the exact mode.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    wanted: vk::PresentModeKHR,
    strict: bool,
) -> FrameResult<vk::PresentModeKHR> {
    if available.is_empty() {
        return Err(FrameError::NoPresentMode);
    }
    if available.contains(&wanted) {
        return Ok(wanted);
    }
    if strict {
        return Err(FrameError::PresentModeUnsupported(wanted));
    }

    log::warn!("Present mode {:?} unavailable, falling back to FIFO", wanted);
    Ok(vk::PresentModeKHR::FIFO)
}

/// The surface dictates the extent unless it reports the special value
/// u32::MAX, in which case the requested size is clamped to its limits.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// Create a swapchain for `surface`, retiring `old_swapchain` if given.
/// The old handle stays alive; the caller destroys it.
pub fn create_swapchain(
    device: &VulkanDevice,
    loader: &ash::extensions::khr::Swapchain,
    surface: vk::SurfaceKHR,
    desc: &SwapchainDesc,
    old_swapchain: vk::SwapchainKHR,
) -> FrameResult<SwapchainImages> {
    let surface_loader = &device.surface_loader;
    let (caps, formats, present_modes) = unsafe {
        (
            surface_loader.get_physical_device_surface_capabilities(device.physical_device, surface)?,
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)?,
            surface_loader.get_physical_device_surface_present_modes(device.physical_device, surface)?,
        )
    };

    let surface_format = choose_surface_format(&formats)?;
    let present_mode = choose_present_mode(&present_modes, desc.present_mode, desc.strict_present_mode)?;
    let extent = choose_extent(&caps, desc.extent);
    if extent.width == 0 || extent.height == 0 {
        return Err(FrameError::ZeroExtent);
    }
    let image_count = choose_image_count(&caps);

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = unsafe { loader.create_swapchain(&create_info, None) }?;
    let images = unsafe { loader.get_swapchain_images(handle) }?;

    log::info!(
        "Created swapchain: {} images, {}x{}, {:?}",
        images.len(),
        extent.width,
        extent.height,
        present_mode
    );

    Ok(SwapchainImages {
        handle,
        images,
        format: surface_format.format,
        extent,
    })
}
