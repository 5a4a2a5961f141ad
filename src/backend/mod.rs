//! Backend module for talking to the wearable device
//!
//! The device SDK drives its own thread and calls back into the relay for
//! every captured image. This module defines the seam between that world and
//! the async pipeline.
//!
//! # Components
//!
//! - [`DeviceClient`] / [`Device`] - Connection and streaming control
//! - [`StreamObserver`] - Synchronous driver callbacks (image, failure)
//! - [`MockDeviceBackend`] - Simulated device for running without hardware
//!   (feature-gated)
//! - [`AriaCli`] - Pairing through the vendor command line tool
//!
//! # Example
//!
//! ```ignore
//! use aria_relay::backend::{DeviceClient, MockDeviceBackend};
//! use aria_relay::config::DeviceSettings;
//!
//! let client = MockDeviceBackend::new();
//! let device = client.connect(&DeviceSettings::default()).await?;
//! let status = device.status().await?;
//! println!("battery at {}%", status.battery_level);
//! ```

pub mod device_trait;
#[cfg(feature = "mock-device")]
pub mod mock_device;
pub mod pairing;

pub use device_trait::{Device, DeviceClient, StreamObserver};
#[cfg(test)]
pub use device_trait::MockDeviceClient;
#[cfg(feature = "mock-device")]
pub use mock_device::{
    CallCountSnapshot, DeviceCallCounts, MockDevice, MockDeviceBackend, MockDeviceConfig,
};
pub use pairing::{classify_check, classify_pair, AriaCli, PairingStatus, DEFAULT_PAIRING_WAIT};
