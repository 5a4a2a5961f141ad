//! Configuration module for aria-relay
//!
//! The relay reads a single TOML file. Every table and key is optional, so an
//! empty file yields [`RelayConfig::default`].
//!
//! # Config File Location
//!
//! The file is resolved in this order:
//! 1. The `--config` command line flag
//! 2. The `ARIA_RELAY_CONFIG` environment variable
//! 3. `./aria-relay.toml` in the working directory
//! 4. The platform config directory:
//!    - **Linux**: `~/.config/aria-relay/config.toml`
//!    - **macOS**: `~/Library/Application Support/aria-relay/config.toml`
//!    - **Windows**: `%APPDATA%\aria-relay\config.toml`
//!
//! # Example
//!
//! ```toml
//! [device]
//! min_battery_percent = 25
//!
//! [streaming]
//! interface = "usb"
//! sample_divisor = 15
//!
//! [server]
//! port = 9000
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{RelayError, Result, ResultExt};
use crate::pipeline::Topic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "aria-relay";

/// Config filename inside the platform config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Config filename looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "aria-relay.toml";

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "ARIA_RELAY_CONFIG";

/// Get the platform config file path
pub fn platform_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Resolve which config file to load, if any
///
/// An explicit path is returned even if it does not exist, so that loading
/// reports the missing file instead of silently using defaults.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }

    platform_config_path().filter(|p| p.exists())
}

/// Full relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub device: DeviceSettings,
    pub streaming: StreamingSettings,
    pub server: ServerSettings,
    pub inference: InferenceSettings,
    pub broadcast: BroadcastSettings,
    pub bus: BusSettings,
    pub logging: LoggingSettings,
    pub simulator: SimulatorSettings,
}

impl RelayConfig {
    /// Parse a config from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::from_toml_str(&content).with_context(|| format!("{:?}", path))
    }

    /// Resolve and load the config, falling back to defaults when no file exists
    pub fn load_resolved(explicit: Option<&Path>) -> Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => {
                tracing::debug!("Loading config from {:?}", path);
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Serialization(format!("Failed to write config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, content).map_err(|e| {
            RelayError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.streaming.sample_divisor == 0 {
            return Err(RelayError::Config(
                "streaming.sample_divisor must be at least 1".to_string(),
            ));
        }

        if self.device.min_battery_percent > 100 {
            return Err(RelayError::Config(format!(
                "device.min_battery_percent must be 0-100, got {}",
                self.device.min_battery_percent
            )));
        }

        for (key, quality) in [
            ("inference.jpeg_quality", self.inference.jpeg_quality),
            ("broadcast.jpeg_quality", self.broadcast.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(RelayError::Config(format!(
                    "{} must be 1-100, got {}",
                    key, quality
                )));
            }
        }

        if self.inference.enabled {
            reqwest::Url::parse(&self.inference.endpoint).map_err(|e| {
                RelayError::Config(format!(
                    "inference.endpoint {:?} is not a valid URL: {}",
                    self.inference.endpoint, e
                ))
            })?;
        }

        if self.bus.queue_capacity == Some(0) {
            return Err(RelayError::Config(
                "bus.queue_capacity must be at least 1 when set".to_string(),
            ));
        }

        if self.simulator.frame_rate == 0 {
            return Err(RelayError::Config(
                "simulator.frame_rate must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Settings handed to each pipeline run
    ///
    /// Frames are only published to topics an enabled consumer reads.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut frame_topics = Vec::new();
        if self.inference.enabled {
            frame_topics.push(Topic::FRAME);
        }
        if self.broadcast.enabled {
            frame_topics.push(Topic::PREVIEW);
        }
        PipelineSettings::new(self.device.clone(), self.streaming.clone())
            .with_frame_topics(frame_topics)
    }
}
