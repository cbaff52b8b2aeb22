// =============================================================================
// FRAME PACER DEMO
// =============================================================================
//
// Opens a window and drives `FramePacer` with a cleared render pass per
// swapchain image and an empty per-frame buffer.
//
// FRAME FLOW (inside FramePacer::draw):
// 1. Acquire swapchain image
// 2. Wait for the image's dynamic buffer, record it, submit
// 3. Wait for the image's static buffer, submit
// 4. Present
//
// Keys: ESC quits, F11 toggles fullscreen.
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pacer::backend::{create_render_pass, RenderPassConfig, VulkanBackend, VulkanDevice};
use frame_pacer::config::Config;
use frame_pacer::{FramePacer, FrameStatus};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame pacer demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if let Some(e) = app.fatal.take() {
        return Err(e);
    }
    Ok(())
}

/// Initialize logging with optional file header
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Frame Pacer Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Vulkan objects owned by the demo. Field order is drop order: the pacer
/// releases slots and targets before the render pass and backend go away.
struct Renderer {
    pacer: FramePacer<VulkanBackend>,
    render_pass: vk::RenderPass,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    fn new(config: &Config, window: &Window) -> Result<Self> {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, enable_validation, display)?;
        let surface = device.create_surface(display, window_handle)?;
        let backend = Arc::new(VulkanBackend::new(device.clone(), surface)?);

        // The render pass only needs the color format; query it up front
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, surface)?
        };
        let surface_format = frame_pacer::backend::swapchain::choose_surface_format(&formats)?;
        let render_pass = create_render_pass(
            &device.device,
            &RenderPassConfig::present(surface_format.format, config.depth_format()),
        )?;

        let size = window.inner_size();
        let pacer_config = config.pacer_config(size.width, size.height);
        let mut pacer = FramePacer::new(backend, render_pass, pacer_config)?;

        // Nothing changes per frame yet; the buffer only carries the
        // acquire -> static dependency
        pacer.record_dynamic(|_backend, _cmd, _image_index| Ok(()));

        log::info!("Vulkan initialized with {} swapchain images", pacer.image_count());
        Ok(Self { pacer, render_pass, device })
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.pacer.shutdown() {
            log::error!("Shutdown failed: {}", e);
        }
        unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
    }
}

struct App {
    config: Config,
    // Dropped before the window it presents to
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resize event that follows rebuilds the swapchain
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (&self.window, &self.renderer) {
                let stats = renderer.pacer.stats();
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{} dropped, {} rebuilds]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    stats.dropped,
                    stats.recreations
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        // Release GPU objects while the window still exists
        self.renderer = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.renderer = None;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.pacer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(ref mut renderer) = self.renderer else {
                    return;
                };
                match renderer.pacer.draw() {
                    Ok(FrameStatus::Presented { .. }) => self.update_fps(),
                    Ok(FrameStatus::Dropped) => log::debug!("Frame dropped, swapchain rebuilt"),
                    Ok(FrameStatus::Skipped) => {}
                    Err(e) => self.fail(event_loop, anyhow::Error::new(e).context("Render error")),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.renderer = None;
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
