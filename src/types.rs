//! Core data types for aria-relay
//!
//! This module contains the data structures shared between the device
//! backend, the pipeline and the command channel.
//!
//! # Main Types
//!
//! - [`ImageView`] - Borrowed RGB8 buffer handed to the observer by the driver
//! - [`CaptureRecord`] - Per-frame metadata reported by the driver
//! - [`FrameSample`] - Owned, transformed frame that travels through the bus
//! - [`DeviceStatus`] - Battery and identity information
//! - [`PipelineState`] - Lifecycle state of the supervised pipeline
//!
//! # Buffer Ownership
//!
//! The driver owns the pixel buffer it passes into the observer callback and
//! reuses it once the callback returns. [`ImageView`] borrows that buffer for
//! the duration of the call only, so anything that outlives the callback has
//! to be copied into a [`FrameSample`] first.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Camera stream identifier reported with each image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraId {
    /// Forward-facing colour camera
    #[default]
    Rgb,
    /// Left greyscale SLAM camera
    SlamLeft,
    /// Right greyscale SLAM camera
    SlamRight,
    /// Eye tracking camera
    EyeTrack,
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraId::Rgb => write!(f, "rgb"),
            CameraId::SlamLeft => write!(f, "slam-left"),
            CameraId::SlamRight => write!(f, "slam-right"),
            CameraId::EyeTrack => write!(f, "eye-track"),
        }
    }
}

/// Rotation applied to frames before they leave the driver thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// Keep the sensor orientation
    None,
    /// Rotate 90 degrees clockwise (the RGB sensor is mounted sideways)
    #[default]
    Clockwise90,
    /// Rotate 180 degrees
    Rotate180,
    /// Rotate 90 degrees counter-clockwise
    CounterClockwise90,
}

impl Rotation {
    /// Apply the rotation, producing a new owned image
    pub fn apply(self, image: RgbImage) -> RgbImage {
        match self {
            Rotation::None => image,
            Rotation::Clockwise90 => image::imageops::rotate90(&image),
            Rotation::Rotate180 => image::imageops::rotate180(&image),
            Rotation::CounterClockwise90 => image::imageops::rotate270(&image),
        }
    }
}

/// Borrowed RGB8 pixel buffer, valid only inside the driver callback
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB8 rows, `width * height * 3` bytes
    pub data: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(width: u32, height: u32, data: &'a [u8]) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Copy the borrowed pixels into an owned image.
    ///
    /// Returns `None` if the buffer length does not match the dimensions.
    pub fn to_owned_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.to_vec())
    }
}

/// Metadata the driver reports alongside each image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub camera: CameraId,
    /// Device capture time in nanoseconds
    pub capture_timestamp_ns: i64,
    /// Frame number assigned by the driver
    pub frame_number: u64,
}

/// An owned, already transformed frame travelling through the bus
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub image: RgbImage,
    pub record: CaptureRecord,
    /// Position of this frame in the bridge's sample counter
    pub sample_index: u64,
}

impl FrameSample {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Reasons the streaming client reports a fatal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingErrorCode {
    ConnectionLost,
    Timeout,
    AuthenticationFailed,
    Internal,
}

impl std::fmt::Display for StreamingErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingErrorCode::ConnectionLost => write!(f, "connection lost"),
            StreamingErrorCode::Timeout => write!(f, "timeout"),
            StreamingErrorCode::AuthenticationFailed => write!(f, "authentication failed"),
            StreamingErrorCode::Internal => write!(f, "internal error"),
        }
    }
}

/// Device status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Battery charge in percent (0-100)
    pub battery_level: u8,
    /// Device serial or display name
    pub serial: String,
}

/// One object detection returned by the inference service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
}

/// Body returned by the inference service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InferenceResponse {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// Lifecycle state of the supervised pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No pipeline task is live
    #[default]
    Idle,
    /// Connecting and starting the stream
    Starting,
    /// Streaming and feeding consumers
    Running,
    /// Cancellation requested, teardown in progress
    Stopping,
    /// The last run ended with an error; teardown has completed
    Failed { reason: String },
}

impl PipelineState {
    /// Whether a pipeline task is still live in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Starting | PipelineState::Running | PipelineState::Stopping
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::Starting => write!(f, "Starting"),
            PipelineState::Running => write!(f, "Running"),
            PipelineState::Stopping => write!(f, "Stopping"),
            PipelineState::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}
