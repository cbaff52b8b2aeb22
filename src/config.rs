// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section and field has a default, so a partial or missing file still
// yields a usable config.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::SwapchainDesc;
use crate::frame::PacerConfig;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pacer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    /// Fail at swapchain creation instead of falling back to FIFO
    pub strict_present_mode: bool,
    pub clear_color: [f32; 4],
    pub depth_format: String,
    /// Unset means wait forever
    pub acquire_timeout_ms: Option<u64>,
    pub fence_timeout_ms: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            strict_present_mode: false,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            depth_format: "d32_sfloat".to_string(),
            acquire_timeout_ms: None,
            fence_timeout_ms: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_pacer.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Get depth format as Vulkan enum
    pub fn depth_format(&self) -> vk::Format {
        match self.graphics.depth_format.to_lowercase().as_str() {
            "d16_unorm" => vk::Format::D16_UNORM,
            "d32_sfloat" => vk::Format::D32_SFLOAT,
            "d24_unorm_s8_uint" => vk::Format::D24_UNORM_S8_UINT,
            "d32_sfloat_s8_uint" => vk::Format::D32_SFLOAT_S8_UINT,
            _ => {
                log::warn!(
                    "Unknown depth format '{}', defaulting to D32_SFLOAT",
                    self.graphics.depth_format
                );
                vk::Format::D32_SFLOAT
            }
        }
    }

    /// Frame pacer settings for a window of `width` x `height`
    pub fn pacer_config(&self, width: u32, height: u32) -> PacerConfig {
        let to_ns = |ms: Option<u64>| ms.map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000));

        PacerConfig {
            swapchain: SwapchainDesc {
                extent: vk::Extent2D { width, height },
                present_mode: self.present_mode(),
                strict_present_mode: self.graphics.strict_present_mode,
                depth_format: self.depth_format(),
            },
            clear_color: self.graphics.clear_color,
            acquire_timeout_ns: to_ns(self.graphics.acquire_timeout_ms),
            fence_timeout_ns: to_ns(self.graphics.fence_timeout_ms),
        }
    }
}
