// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional. A missing file gives the defaults below; a file
// that fails to parse is reported and the defaults are used instead.
// XR_RENDERER_CONFIG points at a different file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::{BlendMode, ReferenceSpaceType, ViewConfigurationType};

pub const CONFIG_PATH_ENV: &str = "XR_RENDERER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub runtime: RuntimeConfig,
    pub session: SessionConfig,
    pub frame: FrameConfig,
    pub graphics: GraphicsConfig,
    pub simulation: SimulationConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "XR Renderer".to_string(),
        }
    }
}

/// Which XR runtime to talk to
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: String,
    /// Sleep between event polls while no frame loop is running.
    pub idle_poll_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: "simulated".to_string(),
            idle_poll_ms: 10,
        }
    }
}

/// Session settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub view_configuration: String,
    pub reference_space: String,
    pub blend_mode: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            view_configuration: "stereo".to_string(),
            reference_space: "stage".to_string(),
            blend_mode: "opaque".to_string(),
        }
    }
}

/// Frame loop settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// 0 means the acquired image must already be writable.
    pub image_wait_timeout_ms: u64,
    /// Also skip drawing when the runtime's should-render hint is false.
    pub honor_should_render: bool,
    pub stats_interval_frames: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            image_wait_timeout_ms: 0,
            honor_should_render: false,
            stats_interval_frames: 300,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Only read with the simulated runtime; OpenXR always renders with Vulkan.
    pub backend: String,
    pub clear_color: [f32; 4],
    pub validation_layers: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: "headless".to_string(),
            clear_color: [0.0, 1.0, 0.0, 1.0],
            validation_layers: true,
        }
    }
}

/// Simulated runtime settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub view_count: usize,
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub ring_size: usize,
    pub refresh_rate_hz: f32,
    /// Frames after which the runtime asks the session to stop (0 = never).
    pub exit_after_frames: u64,
    pub should_render: bool,
    /// Block in wait_frame until the next display slot, like a real runtime.
    pub paced: bool,
    /// Most recent runtime calls kept for inspection.
    pub journal_depth: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            view_count: 2,
            recommended_width: 1440,
            recommended_height: 1600,
            ring_size: 3,
            refresh_rate_hz: 90.0,
            exit_after_frames: 600,
            should_render: true,
            paced: true,
            journal_depth: 4096,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "xr_renderer.log".to_string(),
        }
    }
}

/// Where the configuration came from. Loading runs before the logger
/// exists, so the outcome is kept and reported once logging is up.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid { path: PathBuf, error: anyhow::Error },
}

impl ConfigSource {
    pub fn report(&self, config: &Config) {
        match self {
            ConfigSource::File(path) => {
                log::info!("Loaded configuration from {:?}", path);
                log::debug!("Config: {:?}", config);
            }
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path);
            }
            ConfigSource::Invalid { path, error } => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, error);
            }
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if it is
    /// missing or malformed
    pub fn load() -> (Self, ConfigSource) {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: Into<PathBuf>>(path: P) -> (Self, ConfigSource) {
        let path = path.into();
        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path));
        }
        match Self::read(&path) {
            Ok(config) => (config, ConfigSource::File(path)),
            Err(error) => (Config::default(), ConfigSource::Invalid { path, error }),
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn view_configuration(&self) -> ViewConfigurationType {
        match self.session.view_configuration.to_lowercase().as_str() {
            "stereo" | "primary_stereo" => ViewConfigurationType::PrimaryStereo,
            "mono" | "primary_mono" => ViewConfigurationType::PrimaryMono,
            _ => {
                log::warn!(
                    "Unknown view configuration '{}', defaulting to stereo",
                    self.session.view_configuration
                );
                ViewConfigurationType::PrimaryStereo
            }
        }
    }

    pub fn reference_space(&self) -> ReferenceSpaceType {
        match self.session.reference_space.to_lowercase().as_str() {
            "stage" => ReferenceSpaceType::Stage,
            "local" => ReferenceSpaceType::Local,
            "view" => ReferenceSpaceType::View,
            _ => {
                log::warn!(
                    "Unknown reference space '{}', defaulting to stage",
                    self.session.reference_space
                );
                ReferenceSpaceType::Stage
            }
        }
    }

    pub fn blend_mode(&self) -> BlendMode {
        match self.session.blend_mode.to_lowercase().as_str() {
            "opaque" => BlendMode::Opaque,
            "additive" => BlendMode::Additive,
            "alpha_blend" => BlendMode::AlphaBlend,
            _ => {
                log::warn!(
                    "Unknown blend mode '{}', defaulting to opaque",
                    self.session.blend_mode
                );
                BlendMode::Opaque
            }
        }
    }

    pub fn image_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.frame.image_wait_timeout_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.runtime.idle_poll_ms)
    }

    /// Configured level, `None` if it is not a level name. Read while the
    /// logger is being built, so the caller reports a bad value.
    pub fn log_level(&self) -> Option<log::LevelFilter> {
        self.debug.log_level.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.runtime.backend, "simulated");
        assert_eq!(config.frame.image_wait_timeout_ms, 0);
        assert!(!config.frame.honor_should_render);
        assert_eq!(config.view_configuration(), ViewConfigurationType::PrimaryStereo);
        assert_eq!(config.reference_space(), ReferenceSpaceType::Stage);
        assert_eq!(config.simulation.view_count, 2);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [session]
            reference_space = "local"
            blend_mode = "alpha_blend"

            [frame]
            image_wait_timeout_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.reference_space(), ReferenceSpaceType::Local);
        assert_eq!(config.blend_mode(), BlendMode::AlphaBlend);
        assert_eq!(config.image_wait_timeout(), Duration::from_millis(5));
        assert_eq!(config.session.view_configuration, "stereo");
        assert_eq!(config.frame.stats_interval_frames, 300);
    }

    #[test]
    fn unknown_strings_fall_back() {
        let config = Config::from_toml(
            r#"
            [session]
            view_configuration = "quad"
            reference_space = "ceiling"

            [debug]
            log_level = "loud"
            "#,
        )
        .unwrap();
        assert_eq!(config.view_configuration(), ViewConfigurationType::PrimaryStereo);
        assert_eq!(config.reference_space(), ReferenceSpaceType::Stage);
        assert_eq!(config.log_level(), None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::from_toml("[frame]\nimage_wait_timeout_ms = \"soon\"").is_err());
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("xr-renderer-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn load_outcome_is_kept_for_reporting() {
        let missing = scratch_path("missing");
        let _ = std::fs::remove_file(&missing);
        let (config, source) = Config::load_from_path(&missing);
        assert!(matches!(source, ConfigSource::Missing(_)));
        assert_eq!(config.runtime.backend, "simulated");

        let malformed = scratch_path("malformed");
        std::fs::write(&malformed, "[frame]\nimage_wait_timeout_ms = \"soon\"\n").unwrap();
        let (config, source) = Config::load_from_path(&malformed);
        match &source {
            ConfigSource::Invalid { path, error } => {
                assert_eq!(path, &malformed);
                assert!(format!("{:#}", error).contains("Failed to parse config file"));
            }
            other => panic!("expected an invalid source, got {:?}", other),
        }
        assert_eq!(config.frame.image_wait_timeout_ms, 0);

        std::fs::write(&malformed, "[debug]\nlog_level = \"debug\"\n").unwrap();
        let (config, source) = Config::load_from_path(&malformed);
        assert!(matches!(source, ConfigSource::File(_)));
        assert_eq!(config.log_level(), Some(log::LevelFilter::Debug));
        let _ = std::fs::remove_file(&malformed);
    }
}
