// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and surface extensions
// - Physical device selection (prefer discrete GPU)
// - Logical device + queue creation
// - Surface creation from raw window handles
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Vulkan device wrapper with automatic cleanup
///
/// Passed around as `Arc<VulkanDevice>`; nothing in the crate reaches for a
/// global device.
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    pub allocator: ManuallyDrop<Mutex<gpu_allocator::vulkan::Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,
    pub surface_loader: ash::extensions::khr::Surface,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `display` - Display the surface will be created on; picks the
    ///   platform surface extension
    pub fn new(app_name: &str, enable_validation: bool, display: RawDisplayHandle) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            surface_loader,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
        }))
    }

    /// Instance extensions needed to present on `display`
    pub fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
        let platform = match display {
            RawDisplayHandle::Windows(_) => ash::extensions::khr::Win32Surface::name(),
            RawDisplayHandle::Xlib(_) => ash::extensions::khr::XlibSurface::name(),
            RawDisplayHandle::Xcb(_) => ash::extensions::khr::XcbSurface::name(),
            RawDisplayHandle::Wayland(_) => ash::extensions::khr::WaylandSurface::name(),
            other => anyhow::bail!("Unsupported display type: {:?}", other),
        };
        Ok(vec![ash::extensions::khr::Surface::name().as_ptr(), platform.as_ptr()])
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("frame-pacer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = Self::surface_extensions(display)?;
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| i as u32);

            if let Some(graphics_family) = graphics_family {
                // Prefer discrete GPU
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<gpu_allocator::vulkan::Allocator> {
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })?;

        Ok(allocator)
    }

    /// Create a presentable surface for a window
    pub fn create_surface(&self, display: RawDisplayHandle, window: RawWindowHandle) -> Result<vk::SurfaceKHR> {
        let surface = unsafe {
            match (display, window) {
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                    let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                    let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance)
                        .hwnd(hwnd);
                    ash::extensions::khr::Win32Surface::new(&self.entry, &self.instance)
                        .create_win32_surface(&create_info, None)?
                }
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                    let dpy = display
                        .display
                        .context("Xlib display handle is missing")?
                        .as_ptr();
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy as *mut vk::Display)
                        .window(handle.window);
                    ash::extensions::khr::XlibSurface::new(&self.entry, &self.instance)
                        .create_xlib_surface(&create_info, None)?
                }
                (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                    let connection = display
                        .connection
                        .context("XCB connection handle is missing")?
                        .as_ptr();
                    let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection as *mut vk::xcb_connection_t)
                        .window(handle.window.get());
                    ash::extensions::khr::XcbSurface::new(&self.entry, &self.instance)
                        .create_xcb_surface(&create_info, None)?
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr() as *mut vk::wl_display)
                        .surface(handle.surface.as_ptr() as *mut vk::wl_surface);
                    ash::extensions::khr::WaylandSurface::new(&self.entry, &self.instance)
                        .create_wayland_surface(&create_info, None)?
                }
                _ => anyhow::bail!("Unsupported window handle type"),
            }
        };

        // Verify the GPU supports presenting to this surface
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                self.graphics_queue_family,
                surface,
            )?
        };
        if !supported {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        Ok(surface)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
