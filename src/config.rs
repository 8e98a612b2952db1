// =============================================================================
// CONFIGURATION - window, presentation, asset paths and debug switches
// =============================================================================
//
// Every key is optional. A missing config.toml means all defaults; a broken
// one is reported and also falls back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
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
            title: "Mipmap Renderer".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "mailbox", "fifo", "fifo_relaxed" or "immediate"; FIFO if unavailable
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Files loaded at startup
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub model_path: PathBuf,
    pub texture_path: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            model_path: "assets/viking_room/viking_room.obj".into(),
            texture_path: "assets/viking_room/viking_room.png".into(),
            vertex_shader: "shaders/mesh.vert.spv".into(),
            fragment_shader: "shaders/mesh.frag.spv".into(),
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
            log_file: "mipmap_renderer.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults if it is missing or broken.
    ///
    /// Runs before the logger exists, so the failure is handed back for the
    /// caller to report.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path; a missing file means defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the renderer can't run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.graphics.max_frames_in_flight >= 1,
            "graphics.max_frames_in_flight must be at least 1"
        );
        anyhow::ensure!(
            self.window.width > 0 && self.window.height > 0,
            "window size must be non-zero, got {}x{}",
            self.window.width,
            self.window.height
        );
        Ok(())
    }

    /// Preferred present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.assets.vertex_shader, PathBuf::from("shaders/mesh.vert.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            present_mode = "FIFO"
            max_frames_in_flight = 3

            [assets]
            texture_path = "textures/brick.png"
            "#,
        )
        .unwrap();

        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.assets.texture_path, PathBuf::from("textures/brick.png"));
        assert_eq!(config.assets.model_path, PathBuf::from("assets/viking_room/viking_room.obj"));
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = Config::from_toml_str("[graphics]\nmax_frames_in_flight = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("max_frames_in_flight"));
    }

    #[test]
    fn unknown_present_mode_prefers_mailbox() {
        let config = Config::from_toml_str("[graphics]\npresent_mode = \"vsync-ish\"\n").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[window\nwidth = 3").is_err());
        assert!(Config::from_toml_str("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn broken_file_yields_defaults_and_the_error() {
        let path = std::env::temp_dir().join(format!("mipmap-renderer-{}.toml", std::process::id()));
        std::fs::write(&path, "[graphics]\nmax_frames_in_flight = 0\n").unwrap();

        let (config, error) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.graphics.max_frames_in_flight, 2);
        let error = error.expect("invalid file must be reported");
        assert!(format!("{:#}", error).contains("max_frames_in_flight"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.window.title, "Mipmap Renderer");

        let (_, error) = Config::load_or_default("does/not/exist.toml");
        assert!(error.is_none());
    }
}
