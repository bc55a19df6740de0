//! Configuration module
//!
//! Handles loading and saving keyswap configuration. Remap rules live here
//! as data, not compiled-in literals.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::device::event::{KEY_A, KEY_B, KEY_ESC};
use crate::remap::RemapRule;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Remap settings
    #[serde(default)]
    pub remap: RemapConfig,

    /// Event loop settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path of the physical device to grab
    #[serde(default = "default_device_path")]
    pub path: PathBuf,
    /// Path of the uinput control node
    #[serde(default = "default_uinput_path")]
    pub uinput_path: PathBuf,
    /// Name the virtual device advertises to the system
    #[serde(default = "default_virtual_name")]
    pub virtual_name: String,
}

fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/input/event17")
}

fn default_uinput_path() -> PathBuf {
    PathBuf::from("/dev/uinput")
}

fn default_virtual_name() -> String {
    "keyswap virtual device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            uinput_path: default_uinput_path(),
            virtual_name: default_virtual_name(),
        }
    }
}

/// Remap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapConfig {
    /// Substitution rules; each matches (type, source) and replaces the code
    #[serde(default = "default_rules")]
    pub rules: Vec<RemapRule>,
    /// Key whose press or release (post-remap) shuts the pipeline down
    #[serde(default = "default_terminate_key")]
    pub terminate_key: u16,
}

fn default_rules() -> Vec<RemapRule> {
    vec![RemapRule::key(KEY_A, KEY_B)]
}

fn default_terminate_key() -> u16 {
    KEY_ESC
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            terminate_key: default_terminate_key(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long one poll() waits before re-checking the shutdown flag (ms)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Log every forwarded event at debug level
    #[serde(default)]
    pub trace_events: bool,
}

fn default_poll_timeout() -> u64 {
    500
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            trace_events: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("keyswap/config.toml")),
            Some(PathBuf::from("./keyswap.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> String {
    let config = Config {
        device: DeviceConfig {
            path: PathBuf::from("/dev/input/event3"),
            ..Default::default()
        },
        ..Default::default()
    };

    toml::to_string_pretty(&config).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.uinput_path, PathBuf::from("/dev/uinput"));
        assert_eq!(config.remap.terminate_key, KEY_ESC);
        assert_eq!(config.remap.rules.len(), 1);
        assert_eq!(config.remap.rules[0].source, KEY_A);
        assert_eq!(config.remap.rules[0].target, KEY_B);
        assert_eq!(config.pipeline.poll_timeout_ms, 500);
    }

    #[test]
    fn test_save_and_load() {
        let config = Config::default();
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.device.path, config.device.path);
        assert_eq!(loaded.remap.terminate_key, config.remap.terminate_key);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.device.path, PathBuf::from("/dev/input/event3"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [device]
            path = "/dev/input/event5"

            [[remap.rules]]
            source = 16
            target = 17
            "#,
        )
        .unwrap();
        assert_eq!(parsed.device.path, PathBuf::from("/dev/input/event5"));
        assert_eq!(parsed.device.uinput_path, PathBuf::from("/dev/uinput"));
        assert_eq!(parsed.remap.rules.len(), 1);
        assert_eq!(parsed.remap.rules[0].source, 16);
        assert_eq!(parsed.remap.terminate_key, KEY_ESC);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/no/such/keyswap.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
