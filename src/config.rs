// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Device selection, shader pipeline and logging settings. Provides sensible
// defaults if the config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment override for `device.disable_workarounds`.
pub const DISABLE_WORKAROUNDS_ENV: &str = "VKSCENE_DISABLE_DEVICE_WORKAROUNDS";

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub shaders: ShaderConfig,
    pub logging: LoggingConfig,
}

/// Device selection settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    /// Skip the device workaround pass entirely
    pub disable_workarounds: bool,
    pub validation: bool,
    pub validation_layers: Vec<String>,
    /// No swapchain extension is requested when headless
    pub headless: bool,
    /// Substring matched against "<vendor> <name>"; empty matches nothing
    pub preferred_device: String,
    pub extensions: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disable_workarounds: false,
            validation: false,
            validation_layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
            headless: false,
            preferred_device: String::new(),
            extensions: Vec::new(),
        }
    }
}

/// Shader compilation and cross-compilation settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShaderConfig {
    /// Shared resource root used when the owner's root lacks a shader
    pub default_root: PathBuf,
    /// GLSL -> SPIR-V compiler executable
    pub compiler: String,
    /// SPIR-V -> GLSL emitter executable
    pub cross_compiler: String,
    pub legacy_glsl_version: u32,
    pub watch: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            default_root: PathBuf::from("shaders"),
            compiler: "glslc".to_string(),
            cross_compiler: "spirv-cross".to_string(),
            legacy_glsl_version: 410,
            watch: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if it is
    /// missing or does not parse
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            Config::default().with_env_overrides()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config.with_env_overrides())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(DISABLE_WORKAROUNDS_ENV) {
            self.device.disable_workarounds = parse_flag(&value);
        }
        self
    }

    /// Validation layers to enable, empty unless validation is on
    pub fn enabled_validation_layers(&self) -> Vec<String> {
        if self.device.validation {
            self.device.validation_layers.clone()
        } else {
            Vec::new()
        }
    }

    /// Get the configured log level, defaulting to Info
    pub fn log_level(&self) -> log::LevelFilter {
        self.logging.level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown log level '{}', defaulting to info",
                self.logging.level
            );
            log::LevelFilter::Info
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config = Config::from_toml(
            r#"
            [device]
            disable_workarounds = true
            preferred_device = "Nvidia"

            [shaders]
            legacy_glsl_version = 330
            "#,
        )
        .unwrap();

        assert!(config.device.disable_workarounds);
        assert_eq!(config.device.preferred_device, "Nvidia");
        assert!(!config.device.headless);
        assert_eq!(config.shaders.legacy_glsl_version, 330);
        assert_eq!(config.shaders.compiler, "glslc");
        assert_eq!(config.shaders.default_root, PathBuf::from("shaders"));
    }

    #[test]
    fn validation_layers_only_when_enabled() {
        let mut config = Config::default();
        assert!(config.enabled_validation_layers().is_empty());

        config.device.validation = true;
        assert_eq!(
            config.enabled_validation_layers(),
            vec!["VK_LAYER_KHRONOS_validation".to_string()]
        );
    }

    #[test]
    fn log_level_parses_and_falls_back() {
        let mut config = Config::default();
        config.logging.level = "debug".into();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);

        config.logging.level = "chatty".into();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn flag_values() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" 1 "));
        assert!(parse_flag("YES"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[shaders\nlegacy_glsl_version = ").unwrap();

        assert!(Config::load_from_path(&path).is_err());
        let config = Config::load(&path);
        assert_eq!(config.shaders.legacy_glsl_version, Config::default().shaders.legacy_glsl_version);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.shaders.cross_compiler, "spirv-cross");
    }
}
