//! Configuration file handling for sensorpic.
//!
//! Loads configuration from `<config_dir>/sensorpic/config.toml` or a custom path.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::camera::{HardwareTier, LifecycleOptions, PixelFormat};
use crate::detection::DEFAULT_THRESHOLD_PERCENT;

/// Configuration file structure for sensorpic.
/// Loaded from <config_dir>/sensorpic/config.toml (or custom path via --config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device id as reported by `list-devices`
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    /// Devices below this tier are refused
    #[serde(default = "default_required_tier")]
    pub required_tier: HardwareTier,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            pixel_format: default_pixel_format(),
            required_tier: default_required_tier(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Percentage (0-100) a recognition must reach to count as blocked
    #[serde(default = "default_threshold")]
    pub threshold: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

fn default_device() -> String {
    "0".to_string()
}

fn default_pixel_format() -> PixelFormat {
    PixelFormat::Yuv420
}

fn default_required_tier() -> HardwareTier {
    HardwareTier::Full
}

fn default_threshold() -> u8 {
    DEFAULT_THRESHOLD_PERCENT
}

/// Written by `sensorpic config init`.
pub const DEFAULT_CONFIG: &str = r#"# sensorpic configuration

[camera]
# Camera device id (see `sensorpic list-devices`)
device = "0"
# Pixel format delivered to the classifier: yuv420, nv21, jpeg, rgb
pixel_format = "yuv420"
# Lowest accepted hardware tier: legacy, limited, full, level3
required_tier = "full"

[detection]
# Confidence (percent) at which the lens counts as blocked
threshold = 75
"#;

impl Config {
    /// Load configuration from a file path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed or holds
    /// an out-of-range value.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_path);

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
                path: path.clone(),
                source: e,
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.clone(),
                source: e,
            })?;
            config.validate(&path)?;
            Ok(config)
        } else {
            log::debug!("No config file at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        if self.detection.threshold > 100 {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                key: "detection.threshold",
                message: format!("{} is not a percentage (0-100)", self.detection.threshold),
            });
        }
        Ok(())
    }

    /// Detection threshold as a confidence in `0.0..=1.0`.
    pub fn threshold(&self) -> f32 {
        f32::from(self.detection.threshold.min(100)) / 100.0
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            threshold: self.threshold(),
            required_tier: self.camera.required_tier,
        }
    }
}

/// Write [`DEFAULT_CONFIG`] to `path`, creating parent directories.
///
/// Refuses to overwrite an existing file.
pub fn write_default(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    let io_error = |source| ConfigError::IoError {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, DEFAULT_CONFIG).map_err(io_error)
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        key: &'static str,
        message: String,
    },
    AlreadyExists {
        path: PathBuf,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError { path, source } => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::InvalidValue { path, key, message } => {
                write!(
                    f,
                    "Invalid value for '{}' in '{}': {}",
                    key,
                    path.display(),
                    message
                )
            }
            ConfigError::AlreadyExists { path } => {
                write!(f, "Config file already exists: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } | ConfigError::AlreadyExists { .. } => None,
        }
    }
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("sensorpic").join("config.toml"))
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config/sensorpic/config.toml")
        })
}
