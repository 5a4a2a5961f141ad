//! Simulated device for running without hardware
//!
//! [`MockDeviceBackend`] implements [`DeviceClient`] and hands out
//! [`MockDevice`]s that behave like a real driver: once streaming starts, a
//! dedicated OS thread produces synthetic RGB frames at a fixed rate and
//! invokes the installed [`StreamObserver`] from that thread, with a buffer it
//! reuses between frames.
//!
//! # Features
//!
//! - **Configurable battery**: exercise the low-battery refusal path
//! - **Frame rate and size**: match the sensor profile being simulated
//! - **Failure injection**: fail `connect`, or report a streaming failure
//!   after a number of frames
//! - **Call counters**: every device call is counted in a shared
//!   [`DeviceCallCounts`] so tests can assert on teardown
//!
//! # Example
//!
//! ```ignore
//! use aria_relay::backend::MockDeviceBackend;
//!
//! let backend = MockDeviceBackend::new().with_battery(15);
//! let calls = backend.calls();
//! // ... run a pipeline against `backend` ...
//! assert_eq!(calls.snapshot().subscribe, 0);
//! ```
//!
//! # Enabling
//!
//! Only available with the `mock-device` feature (on by default).

use crate::config::{DeviceSettings, SimulatorSettings, StreamingSettings};
use crate::error::{RelayError, Result};
use crate::types::{CameraId, CaptureRecord, DeviceStatus, ImageView, StreamingErrorCode};
use async_trait::async_trait;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::device_trait::{Device, DeviceClient, StreamObserver};

/// Counters for every call made against mock devices of one backend
#[derive(Debug, Default)]
pub struct DeviceCallCounts {
    connect: AtomicU64,
    status: AtomicU64,
    start_streaming: AtomicU64,
    stop_streaming: AtomicU64,
    subscribe: AtomicU64,
    unsubscribe: AtomicU64,
    disconnect: AtomicU64,
    frames_delivered: AtomicU64,
}

/// Point-in-time copy of [`DeviceCallCounts`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCountSnapshot {
    pub connect: u64,
    pub status: u64,
    pub start_streaming: u64,
    pub stop_streaming: u64,
    pub subscribe: u64,
    pub unsubscribe: u64,
    pub disconnect: u64,
    pub frames_delivered: u64,
}

impl DeviceCallCounts {
    pub fn snapshot(&self) -> CallCountSnapshot {
        CallCountSnapshot {
            connect: self.connect.load(Ordering::SeqCst),
            status: self.status.load(Ordering::SeqCst),
            start_streaming: self.start_streaming.load(Ordering::SeqCst),
            stop_streaming: self.stop_streaming.load(Ordering::SeqCst),
            subscribe: self.subscribe.load(Ordering::SeqCst),
            unsubscribe: self.unsubscribe.load(Ordering::SeqCst),
            disconnect: self.disconnect.load(Ordering::SeqCst),
            frames_delivered: self.frames_delivered.load(Ordering::SeqCst),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Behaviour of simulated devices
#[derive(Debug, Clone)]
pub struct MockDeviceConfig {
    pub serial: String,
    pub battery_level: u8,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    /// Camera reported with every frame
    pub camera: CameraId,
    /// Simulated connection latency
    pub connect_delay: Duration,
    /// Simulated latency of a status query
    pub status_delay: Duration,
    /// When set, `connect` fails with this message
    pub connect_failure: Option<String>,
    /// When set, the driver reports this failure after producing that many frames
    pub fail_after_frames: Option<(u64, StreamingErrorCode)>,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self::from(&SimulatorSettings::default())
    }
}

impl From<&SimulatorSettings> for MockDeviceConfig {
    fn from(settings: &SimulatorSettings) -> Self {
        Self {
            serial: "MOCK-ARIA-0001".to_string(),
            battery_level: settings.battery_level,
            frame_rate: settings.frame_rate,
            width: settings.width,
            height: settings.height,
            camera: CameraId::Rgb,
            connect_delay: Duration::ZERO,
            status_delay: Duration::ZERO,
            connect_failure: None,
            fail_after_frames: None,
        }
    }
}

/// Mock device SDK entry point
#[derive(Debug, Clone, Default)]
pub struct MockDeviceBackend {
    config: MockDeviceConfig,
    calls: Arc<DeviceCallCounts>,
}

impl MockDeviceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend from the `[simulator]` config table
    pub fn from_settings(settings: &SimulatorSettings) -> Self {
        Self {
            config: MockDeviceConfig::from(settings),
            calls: Arc::default(),
        }
    }

    pub fn with_battery(mut self, level: u8) -> Self {
        self.config.battery_level = level;
        self
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.config.frame_rate = fps;
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    pub fn with_camera(mut self, camera: CameraId) -> Self {
        self.config.camera = camera;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.config.connect_delay = delay;
        self
    }

    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.config.status_delay = delay;
        self
    }

    pub fn with_connect_failure(mut self, message: impl Into<String>) -> Self {
        self.config.connect_failure = Some(message.into());
        self
    }

    /// Report a streaming failure once `frames` frames have been produced
    pub fn with_failure_after(mut self, frames: u64, code: StreamingErrorCode) -> Self {
        self.config.fail_after_frames = Some((frames, code));
        self
    }

    /// Shared call counters of every device this backend connects
    pub fn calls(&self) -> Arc<DeviceCallCounts> {
        Arc::clone(&self.calls)
    }

    pub fn config(&self) -> &MockDeviceConfig {
        &self.config
    }
}

#[async_trait]
impl DeviceClient for MockDeviceBackend {
    async fn connect(&self, settings: &DeviceSettings) -> Result<Box<dyn Device>> {
        DeviceCallCounts::bump(&self.calls.connect);

        if !self.config.connect_delay.is_zero() {
            tokio::time::sleep(self.config.connect_delay).await;
        }

        if let Some(message) = &self.config.connect_failure {
            return Err(RelayError::Device(message.clone()));
        }

        tracing::info!(
            "Mock device {} connected over {:?}{}",
            self.config.serial,
            settings.connection,
            settings
                .ip_address
                .as_deref()
                .map(|ip| format!(" at {}", ip))
                .unwrap_or_default()
        );

        Ok(Box::new(MockDevice::new(
            self.config.clone(),
            Arc::clone(&self.calls),
        )))
    }
}

type SharedObserver = Arc<Mutex<Option<Arc<dyn StreamObserver>>>>;

struct DriverThread {
    stop_tx: Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

/// A connected simulated device
pub struct MockDevice {
    config: MockDeviceConfig,
    calls: Arc<DeviceCallCounts>,
    observer: SharedObserver,
    subscribed: Arc<AtomicBool>,
    connected: AtomicBool,
    driver: Mutex<Option<DriverThread>>,
}

impl MockDevice {
    fn new(config: MockDeviceConfig, calls: Arc<DeviceCallCounts>) -> Self {
        Self {
            config,
            calls,
            observer: Arc::new(Mutex::new(None)),
            subscribed: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(true),
            driver: Mutex::new(None),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Device("Mock device not connected".to_string()))
        }
    }

    fn spawn_driver(&self) -> Result<DriverThread> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let config = self.config.clone();
        let observer = Arc::clone(&self.observer);
        let subscribed = Arc::clone(&self.subscribed);
        let calls = Arc::clone(&self.calls);

        let handle = std::thread::Builder::new()
            .name("mock-driver".to_string())
            .spawn(move || {
                let interval = Duration::from_secs_f64(1.0 / config.frame_rate.max(1) as f64);
                let started = Instant::now();
                let pixels = config.width as usize * config.height as usize * 3;
                let mut buffer = vec![0u8; pixels];
                let mut frame_number = 0u64;

                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    let current = observer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();

                    if let Some((limit, code)) = config.fail_after_frames {
                        if frame_number >= limit {
                            tracing::debug!("Mock driver injecting streaming failure");
                            if let Some(observer) = &current {
                                observer.on_streaming_failure(code, "simulated streaming failure");
                            }
                            break;
                        }
                    }

                    frame_number += 1;
                    if !subscribed.load(Ordering::SeqCst) {
                        continue;
                    }

                    // Moving gradient so consecutive frames differ
                    let shade = (frame_number % 256) as u8;
                    for (i, px) in buffer.chunks_exact_mut(3).enumerate() {
                        let x = (i % config.width.max(1) as usize) as u8;
                        px[0] = x.wrapping_add(shade);
                        px[1] = shade;
                        px[2] = 255 - shade;
                    }

                    let record = CaptureRecord {
                        camera: config.camera,
                        capture_timestamp_ns: started.elapsed().as_nanos() as i64,
                        frame_number,
                    };

                    if let Some(observer) = &current {
                        observer.on_image_received(
                            ImageView::new(config.width, config.height, &buffer),
                            &record,
                        );
                        DeviceCallCounts::bump(&calls.frames_delivered);
                    }
                }

                tracing::debug!("Mock driver thread stopped after {} frames", frame_number);
            })?;

        Ok(DriverThread { stop_tx, handle })
    }
}

#[async_trait]
impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.config.serial
    }

    async fn status(&self) -> Result<DeviceStatus> {
        DeviceCallCounts::bump(&self.calls.status);
        if !self.config.status_delay.is_zero() {
            tokio::time::sleep(self.config.status_delay).await;
        }
        self.ensure_connected()?;
        Ok(DeviceStatus {
            battery_level: self.config.battery_level,
            serial: self.config.serial.clone(),
        })
    }

    fn set_observer(&self, observer: Arc<dyn StreamObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    async fn start_streaming(&self, settings: &StreamingSettings) -> Result<()> {
        DeviceCallCounts::bump(&self.calls.start_streaming);
        self.ensure_connected()?;

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return Err(RelayError::Device("Streaming already started".to_string()));
        }

        tracing::info!(
            "Mock device streaming {} over {} (ephemeral certs: {})",
            settings.profile_name,
            settings.interface,
            settings.use_ephemeral_certs
        );
        *driver = Some(self.spawn_driver()?);
        Ok(())
    }

    async fn stop_streaming(&self) -> Result<()> {
        DeviceCallCounts::bump(&self.calls.stop_streaming);

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(driver) = driver else {
            return Ok(());
        };

        let _ = driver.stop_tx.send(());
        tokio::task::spawn_blocking(move || driver.handle.join())
            .await
            .map_err(|e| RelayError::Device(format!("Failed to join driver thread: {}", e)))?
            .map_err(|_| RelayError::Device("Driver thread panicked".to_string()))
    }

    async fn subscribe(&self) -> Result<()> {
        DeviceCallCounts::bump(&self.calls.subscribe);
        self.ensure_connected()?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        DeviceCallCounts::bump(&self.calls.unsubscribe);
        self.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        DeviceCallCounts::bump(&self.calls.disconnect);
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("Mock device {} disconnected", self.config.serial);
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let driver = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            let _ = driver.stop_tx.send(());
        }
    }
}
