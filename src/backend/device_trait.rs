//! Device driver interface
//!
//! The vendor SDK is reached through three traits:
//!
//! - [`DeviceClient`] - Discovers and connects to a device
//! - [`Device`] - A connected device: status, streaming control, subscription
//! - [`StreamObserver`] - Synchronous callbacks the driver invokes on its own
//!   thread for every captured image and for fatal streaming failures
//!
//! Real SDK bindings and the simulated backend both implement these, so the
//! pipeline never knows which one it is talking to.

use crate::config::{DeviceSettings, StreamingSettings};
use crate::error::Result;
use crate::types::{CaptureRecord, DeviceStatus, ImageView, StreamingErrorCode};
use async_trait::async_trait;
use std::sync::Arc;

/// Receiver of driver callbacks.
///
/// Both methods are called on a thread owned by the driver, never on the
/// scheduler. Implementations must return quickly and must not block on
/// async work. The image buffer is only valid for the duration of the call.
pub trait StreamObserver: Send + Sync {
    fn on_image_received(&self, image: ImageView<'_>, record: &CaptureRecord);

    fn on_streaming_failure(&self, code: StreamingErrorCode, message: &str);
}

/// A connected device
///
/// Methods take `&self`; implementations keep their own interior state so a
/// device can be torn down from a guard that only holds a shared reference.
#[async_trait]
pub trait Device: Send + Sync {
    /// Display name or serial
    fn name(&self) -> &str;

    /// Query battery level and identity
    async fn status(&self) -> Result<DeviceStatus>;

    /// Install the callback receiver. Replaces any previous observer.
    fn set_observer(&self, observer: Arc<dyn StreamObserver>);

    /// Start the sensor stream with the given profile and transport
    async fn start_streaming(&self, settings: &StreamingSettings) -> Result<()>;

    /// Stop the sensor stream
    async fn stop_streaming(&self) -> Result<()>;

    /// Begin delivering captured images to the observer
    async fn subscribe(&self) -> Result<()>;

    /// Stop delivering images to the observer
    async fn unsubscribe(&self) -> Result<()>;

    /// Release the device connection
    async fn disconnect(&self) -> Result<()>;
}

/// Entry point into a device SDK
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Connect to the device described by `settings`
    async fn connect(&self, settings: &DeviceSettings) -> Result<Box<dyn Device>>;
}
