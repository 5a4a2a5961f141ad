//! One pipeline run: connect, stream, park, tear down.
//!
//! # Lifecycle
//!
//! ```text
//! connect ─► battery check ─► install bridge ─► start stream ─► subscribe
//!    │             │                                                │
//!    │             └─ below minimum: abort                          ▼
//!    │                                              spawn consumers, Running
//!    │                                                              │
//!    │                         park until cancelled or device failure
//!    ▼                                                              ▼
//!  (no device: nothing to release)          DeviceSession teardown (always)
//! ```
//!
//! Every await before the park is raced against the cancellation token, so a
//! `stop` during startup is observed at the next step. Once a device is
//! connected it is owned by a [`DeviceSession`], whose teardown runs on every
//! exit path exactly once.

use crate::backend::{Device, DeviceClient};
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::pipeline::bridge::CallbackBridge;
use crate::pipeline::bus::EventBus;
use crate::pipeline::event::{Payload, Topic};
use crate::pipeline::id::SessionId;
use crate::pipeline::nodes::{spawn_consumer, ConsumerFactory, ConsumerStats};
use crate::types::{PipelineState, StreamingErrorCode};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// Stopped on request
    Cancelled,
    /// The battery was below the configured minimum; streaming never started
    LowBattery { level: u8, minimum: u8 },
    /// The streaming client reported a fatal failure
    DeviceFailure {
        code: StreamingErrorCode,
        message: String,
    },
    /// A device call failed
    Error(String),
}

impl PipelineExit {
    /// The supervisor state this exit settles in
    pub fn final_state(&self) -> PipelineState {
        match self {
            PipelineExit::Cancelled => PipelineState::Idle,
            other => PipelineState::Failed {
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for PipelineExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineExit::Cancelled => write!(f, "stopped"),
            PipelineExit::LowBattery { level, minimum } => write!(
                f,
                "Battery level {}% is below the minimum of {}%",
                level, minimum
            ),
            PipelineExit::DeviceFailure { code, message } => {
                write!(f, "Streaming failed ({}): {}", code, message)
            }
            PipelineExit::Error(message) => write!(f, "{}", message),
        }
    }
}

/// A connected device and everything started on it.
///
/// [`teardown`](Self::teardown) releases the device in a fixed order:
/// unsubscribe, stop streaming, cancel and join consumers, disconnect. Each
/// step runs once; later calls are no-ops. A session dropped without teardown
/// schedules it on the current runtime.
pub struct DeviceSession {
    session: SessionId,
    device: Option<Box<dyn Device>>,
    consumers: Vec<JoinHandle<ConsumerStats>>,
    consumer_cancel: CancellationToken,
}

impl DeviceSession {
    pub fn new(device: Box<dyn Device>, session: SessionId) -> Self {
        Self {
            session,
            device: Some(device),
            consumers: Vec::new(),
            consumer_cancel: CancellationToken::new(),
        }
    }

    /// The device, until teardown
    pub fn device(&self) -> Option<&dyn Device> {
        self.device.as_deref()
    }

    /// Token consumers of this session stop on
    pub fn consumer_token(&self) -> CancellationToken {
        self.consumer_cancel.clone()
    }

    pub fn add_consumer(&mut self, handle: JoinHandle<ConsumerStats>) {
        self.consumers.push(handle);
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }

    /// Release the device. Safe to call more than once.
    pub async fn teardown(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        release(
            self.session,
            device,
            std::mem::take(&mut self.consumers),
            self.consumer_cancel.clone(),
        )
        .await;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };

        let consumers = std::mem::take(&mut self.consumers);
        let cancel = self.consumer_cancel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(
                    "Session {} dropped without teardown, releasing in background",
                    self.session
                );
                runtime.spawn(release(self.session, device, consumers, cancel));
            }
            Err(_) => {
                cancel.cancel();
                tracing::error!(
                    "Session {} dropped outside a runtime; device {} was not released",
                    self.session,
                    device.name()
                );
            }
        }
    }
}

async fn release(
    session: SessionId,
    device: Box<dyn Device>,
    consumers: Vec<JoinHandle<ConsumerStats>>,
    consumer_cancel: CancellationToken,
) {
    tracing::debug!("Session {}: releasing {}", session, device.name());

    if let Err(e) = device.unsubscribe().await {
        tracing::warn!("Session {}: unsubscribe failed: {}", session, e);
    }
    if let Err(e) = device.stop_streaming().await {
        tracing::warn!("Session {}: stop streaming failed: {}", session, e);
    }

    consumer_cancel.cancel();
    for handle in consumers {
        match handle.await {
            Ok(stats) => tracing::debug!(
                "Session {}: consumer finished ({} handled, {} failed, {} stale)",
                session,
                stats.handled,
                stats.failed,
                stats.stale
            ),
            Err(e) => tracing::warn!("Session {}: consumer task failed: {}", session, e),
        }
    }

    if let Err(e) = device.disconnect().await {
        tracing::warn!("Session {}: disconnect failed: {}", session, e);
    }
    tracing::info!("Session {}: device released", session);
}

/// The body of one pipeline run
pub struct PipelineTask {
    session: SessionId,
    client: Arc<dyn DeviceClient>,
    bus: EventBus,
    settings: PipelineSettings,
    consumers: Vec<Arc<dyn ConsumerFactory>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PipelineState>>,
}

impl PipelineTask {
    pub fn new(
        session: SessionId,
        client: Arc<dyn DeviceClient>,
        bus: EventBus,
        settings: PipelineSettings,
        consumers: Vec<Arc<dyn ConsumerFactory>>,
        cancel: CancellationToken,
        state: Arc<watch::Sender<PipelineState>>,
    ) -> Self {
        Self {
            session,
            client,
            bus,
            settings,
            consumers,
            cancel,
            state,
        }
    }

    /// Run until cancelled, failed or refused. The device, if one was
    /// connected, is released before this returns.
    pub async fn run(self) -> PipelineExit {
        tracing::info!("Session {}: starting pipeline", self.session);

        let device = match self.step(self.client.connect(&self.settings.device)).await {
            Step::Done(device) => device,
            Step::Failed(e) => return PipelineExit::Error(format!("Failed to connect: {}", e)),
            Step::Cancelled => return PipelineExit::Cancelled,
        };
        tracing::info!("Session {}: connected to {}", self.session, device.name());

        let mut session = DeviceSession::new(device, self.session);
        let exit = self.drive(&mut session).await;
        session.teardown().await;

        match &exit {
            PipelineExit::Cancelled => tracing::info!("Session {}: stopped", self.session),
            other => tracing::warn!("Session {}: ended: {}", self.session, other),
        }
        exit
    }

    async fn step<T>(&self, call: impl Future<Output = Result<T>>) -> Step<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Step::Cancelled,
            result = call => match result {
                Ok(value) => Step::Done(value),
                Err(e) => Step::Failed(e),
            },
        }
    }

    async fn drive(&self, session: &mut DeviceSession) -> PipelineExit {
        let Some(device) = session.device() else {
            return PipelineExit::Error("Device released before streaming".to_string());
        };

        let status = match self.step(device.status()).await {
            Step::Done(status) => status,
            Step::Failed(e) => {
                return PipelineExit::Error(format!("Failed to read device status: {}", e))
            }
            Step::Cancelled => return PipelineExit::Cancelled,
        };

        let minimum = self.settings.device.min_battery_percent;
        if status.battery_level < minimum {
            tracing::warn!(
                "Session {}: battery at {}%, need at least {}%; not streaming",
                self.session,
                status.battery_level,
                minimum
            );
            return PipelineExit::LowBattery {
                level: status.battery_level,
                minimum,
            };
        }
        tracing::info!("Session {}: battery at {}%", self.session, status.battery_level);

        if self.cancel.is_cancelled() {
            return PipelineExit::Cancelled;
        }

        let bridge = CallbackBridge::new(
            self.bus.spawn_handoff(),
            self.session,
            &self.settings.streaming,
            self.settings.frame_topics.clone(),
        );
        device.set_observer(Arc::new(bridge));

        match self.step(device.start_streaming(&self.settings.streaming)).await {
            Step::Done(()) => {}
            Step::Failed(e) => {
                return PipelineExit::Error(format!("Failed to start streaming: {}", e))
            }
            Step::Cancelled => return PipelineExit::Cancelled,
        }

        match self.step(device.subscribe()).await {
            Step::Done(()) => {}
            Step::Failed(e) => return PipelineExit::Error(format!("Failed to subscribe: {}", e)),
            Step::Cancelled => return PipelineExit::Cancelled,
        }

        for factory in &self.consumers {
            let consumer = factory.create();
            tracing::debug!("Session {}: starting consumer {}", self.session, consumer.name());
            let handle =
                spawn_consumer(consumer, &self.bus, self.session, session.consumer_token());
            session.add_consumer(handle);
        }

        self.state.send_if_modified(|state| {
            if *state == PipelineState::Starting {
                *state = PipelineState::Running;
                true
            } else {
                false
            }
        });
        tracing::info!("Session {}: streaming", self.session);

        self.park().await
    }

    /// Wait for cancellation or a failure reported for this session
    async fn park(&self) -> PipelineExit {
        let mut failures = self.bus.subscribe(Topic::STREAM_FAILURE);
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return PipelineExit::Cancelled,
                event = failures.next() => event,
            };

            match event.map(|e| e.into_payload()) {
                Some(Payload::StreamFailure {
                    session,
                    code,
                    message,
                }) if session == self.session => {
                    return PipelineExit::DeviceFailure { code, message };
                }
                Some(Payload::StreamFailure { session, .. }) => {
                    tracing::debug!(
                        "Session {}: ignoring failure left over from session {}",
                        self.session,
                        session
                    );
                }
                Some(other) => {
                    tracing::debug!(
                        "Session {}: unexpected failure payload {:?}",
                        self.session,
                        other
                    );
                }
                None => return PipelineExit::Error("Failure stream closed".to_string()),
            }
        }
    }
}

enum Step<T> {
    Done(T),
    Failed(crate::error::RelayError),
    Cancelled,
}
