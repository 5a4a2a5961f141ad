//! Configuration sections
//!
//! Each section maps to one table of the TOML config file. Every field has a
//! serde default so a partial (or empty) file is always accepted.
//!
//! # Main Types
//!
//! - [`DeviceSettings`] - How to reach the device and the battery floor
//! - [`StreamingSettings`] - Streaming profile, transport and frame sampling
//! - [`ServerSettings`] - Command channel listener
//! - [`InferenceSettings`] / [`BroadcastSettings`] - Consumer behaviour
//! - [`BusSettings`] - Optional queue bound
//! - [`LoggingSettings`] - Log filter and log file
//! - [`SimulatorSettings`] - Parameters of the simulated device

use crate::pipeline::event::Topic;
use crate::types::{CameraId, Rotation};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default minimum battery percentage before streaming is allowed
pub const DEFAULT_MIN_BATTERY_PERCENT: u8 = 20;

/// Default command channel port
pub const DEFAULT_COMMAND_PORT: u16 = 8088;

/// Default frame sampling divisor (about one frame per second at 30 fps)
pub const DEFAULT_SAMPLE_DIVISOR: u64 = 30;

/// Default inference endpoint
pub const DEFAULT_INFERENCE_ENDPOINT: &str = "http://127.0.0.1:8008/infer/";

/// How the device link is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Wifi,
    Usb,
}

/// Transport used for the sensor stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamingInterface {
    #[default]
    Wifi,
    Usb,
}

impl std::fmt::Display for StreamingInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingInterface::Wifi => write!(f, "wifi"),
            StreamingInterface::Usb => write!(f, "usb"),
        }
    }
}

/// Device connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub connection: ConnectionType,
    /// Fixed device address; discovered by the driver when unset
    pub ip_address: Option<String>,
    /// Streaming is refused below this battery level
    pub min_battery_percent: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionType::Wifi,
            ip_address: None,
            min_battery_percent: DEFAULT_MIN_BATTERY_PERCENT,
        }
    }
}

/// Streaming session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub profile_name: String,
    pub interface: StreamingInterface,
    pub use_ephemeral_certs: bool,
    /// Camera stream forwarded into the pipeline
    pub camera: CameraId,
    /// Forward every Nth frame of the selected camera
    pub sample_divisor: u64,
    pub rotation: Rotation,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            profile_name: "profile8".to_string(),
            interface: StreamingInterface::Wifi,
            use_ephemeral_certs: true,
            camera: CameraId::Rgb,
            sample_divisor: DEFAULT_SAMPLE_DIVISOR,
            rotation: Rotation::Clockwise90,
        }
    }
}

/// Command channel listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    pub handshake_timeout_ms: u64,
    /// Outbound frames buffered per peer before sends start timing out
    pub outbound_queue: usize,
}

impl ServerSettings {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_COMMAND_PORT,
            handshake_timeout_ms: 5000,
            outbound_queue: 32,
        }
    }
}

/// Inference forwarder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub request_timeout_ms: u64,
    /// Pause after the service is unreachable, to avoid spamming it
    pub backoff_ms: u64,
    pub jpeg_quality: u8,
}

impl InferenceSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: DEFAULT_INFERENCE_ENDPOINT.to_string(),
            request_timeout_ms: 5000,
            backoff_ms: 10_000,
            jpeg_quality: 85,
        }
    }
}

/// Broadcast forwarder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub enabled: bool,
    pub send_timeout_ms: u64,
    pub jpeg_quality: u8,
}

impl BroadcastSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            send_timeout_ms: 1000,
            jpeg_quality: 75,
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BusSettings {
    /// Per-topic queue bound. Unbounded when unset; when set, publishing onto
    /// a full topic drops the newest event.
    pub queue_capacity: Option<usize>,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Log file; console only when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info,aria_relay=debug".to_string(),
            file: Some(PathBuf::from("aria-relay.log")),
        }
    }
}

/// Simulated device parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub battery_level: u8,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            battery_level: 80,
            frame_rate: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Everything a pipeline run needs, extracted from the full config
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub device: DeviceSettings,
    pub streaming: StreamingSettings,
    /// Topics every sampled frame is published to
    pub frame_topics: Vec<Topic>,
}

impl PipelineSettings {
    pub fn new(device: DeviceSettings, streaming: StreamingSettings) -> Self {
        Self {
            device,
            streaming,
            frame_topics: vec![Topic::FRAME, Topic::PREVIEW],
        }
    }

    pub fn with_frame_topics(mut self, topics: Vec<Topic>) -> Self {
        self.frame_topics = topics;
        self
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::new(DeviceSettings::default(), StreamingSettings::default())
    }
}
