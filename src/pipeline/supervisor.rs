//! Start/stop control over the pipeline.
//!
//! The [`Supervisor`] owns at most one [`PipelineTask`] at a time and turns
//! `start`/`stop` commands into state transitions:
//!
//! ```text
//! Idle ─start─► Starting ─► Running ─stop─► Stopping ─► Idle
//!                  │           │
//!                  └───────────┴─ failure / low battery ─► Failed
//! ```
//!
//! Both commands are idempotent. `start` while a task is live (including
//! while it is still stopping) is answered with an error and does nothing;
//! `stop` with no live task likewise. The final state of a run is written by
//! the task itself before it finishes, so a finished task is never observed in
//! an active state.

use crate::backend::DeviceClient;
use crate::config::PipelineSettings;
use crate::pipeline::bus::EventBus;
use crate::pipeline::id::{SessionId, SessionIdAllocator};
use crate::pipeline::nodes::ConsumerFactory;
use crate::pipeline::task::{PipelineExit, PipelineTask};
use crate::server::protocol::{StatusFrame, ALREADY_RUNNING, NOT_RUNNING};
use crate::types::PipelineState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PipelineHandle {
    session: SessionId,
    cancel: CancellationToken,
    join: JoinHandle<PipelineExit>,
}

impl PipelineHandle {
    /// A run is over once it has written a settled state, even if its task
    /// has not been reaped yet
    fn is_live(&self, state: &PipelineState) -> bool {
        !self.join.is_finished() && state.is_active()
    }
}

struct SupervisorInner {
    client: Arc<dyn DeviceClient>,
    bus: EventBus,
    settings: PipelineSettings,
    consumers: Mutex<Vec<Arc<dyn ConsumerFactory>>>,
    state: Arc<watch::Sender<PipelineState>>,
    current: Mutex<Option<PipelineHandle>>,
    ids: SessionIdAllocator,
    spawned: AtomicU64,
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        let current = self
            .current
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = current {
            handle.cancel.cancel();
        }
    }
}

/// Owner of the pipeline lifecycle.
///
/// Cloning is cheap; clones control the same pipeline.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(client: Arc<dyn DeviceClient>, bus: EventBus, settings: PipelineSettings) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            inner: Arc::new(SupervisorInner {
                client,
                bus,
                settings,
                consumers: Mutex::new(Vec::new()),
                state: Arc::new(state),
                current: Mutex::new(None),
                ids: SessionIdAllocator::new(),
                spawned: AtomicU64::new(0),
            }),
        }
    }

    /// Register a consumer started with every pipeline run
    pub fn with_consumer(self, factory: impl ConsumerFactory + 'static) -> Self {
        self.add_consumer(Arc::new(factory));
        self
    }

    pub fn add_consumer(&self, factory: Arc<dyn ConsumerFactory>) {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(factory);
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.inner.state.subscribe()
    }

    /// Number of pipeline tasks spawned so far
    pub fn tasks_spawned(&self) -> u64 {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Session of the live task, if any
    pub fn current_session(&self) -> Option<SessionId> {
        let state = self.state();
        self.lock_current()
            .as_ref()
            .filter(|h| h.is_live(&state))
            .map(|h| h.session)
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<PipelineHandle>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle a `start` command
    pub fn handle_start(&self) -> StatusFrame {
        let mut current = self.lock_current();
        let state = self.state();
        if let Some(handle) = current.as_ref().filter(|h| h.is_live(&state)) {
            tracing::info!("Start ignored: session {} is still live", handle.session);
            return StatusFrame::error(ALREADY_RUNNING);
        }

        let session = self.inner.ids.next();
        let cancel = CancellationToken::new();
        let consumers = self
            .inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        self.inner.state.send_replace(PipelineState::Starting);

        let task = PipelineTask::new(
            session,
            Arc::clone(&self.inner.client),
            self.inner.bus.clone(),
            self.inner.settings.clone(),
            consumers,
            cancel.clone(),
            Arc::clone(&self.inner.state),
        );
        let state = Arc::clone(&self.inner.state);
        let join = tokio::spawn(async move {
            let exit = task.run().await;
            state.send_replace(exit.final_state());
            exit
        });

        self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        *current = Some(PipelineHandle {
            session,
            cancel,
            join,
        });
        tracing::info!("Session {}: start requested", session);
        StatusFrame::Starting
    }

    /// Handle a `stop` command
    pub fn handle_stop(&self) -> StatusFrame {
        let current = self.lock_current();
        let state = self.state();
        let Some(handle) = current.as_ref().filter(|h| h.is_live(&state)) else {
            tracing::info!("Stop ignored: no pipeline is running");
            return StatusFrame::error(NOT_RUNNING);
        };

        handle.cancel.cancel();
        // The task writes its final state itself; never overwrite it
        self.inner.state.send_if_modified(|state| {
            if state.is_active() && *state != PipelineState::Stopping {
                *state = PipelineState::Stopping;
                true
            } else {
                false
            }
        });
        tracing::info!("Session {}: stop requested", handle.session);
        StatusFrame::Stopping
    }

    /// Wait until no pipeline task is live
    pub async fn wait_for_completion(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| !s.is_active()).await;
    }

    /// Stop the live task, if any, and wait for its teardown
    pub async fn shutdown(&self) -> Option<PipelineExit> {
        let handle = self.lock_current().take()?;
        handle.cancel.cancel();
        self.inner.state.send_if_modified(|state| {
            if state.is_active() && *state != PipelineState::Stopping {
                *state = PipelineState::Stopping;
                true
            } else {
                false
            }
        });

        match handle.join.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::error!("Session {}: pipeline task failed: {}", handle.session, e);
                self.inner.state.send_replace(PipelineState::Failed {
                    reason: e.to_string(),
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockDeviceBackend, MockDeviceClient};
    use crate::error::RelayError;
    use std::time::Duration;

    fn supervisor(client: impl DeviceClient + 'static) -> Supervisor {
        Supervisor::new(Arc::new(client), EventBus::new(), PipelineSettings::default())
    }

    async fn wait_for_state(supervisor: &Supervisor, wanted: PipelineState) {
        let mut state = supervisor.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
            .await
            .unwrap_or_else(|_| panic!("never reached {:?}, at {:?}", wanted, supervisor.state()))
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let supervisor = supervisor(MockDeviceBackend::new());
        assert_eq!(supervisor.handle_stop(), StatusFrame::error(NOT_RUNNING));
        assert_eq!(supervisor.state(), PipelineState::Idle);
        assert_eq!(supervisor.tasks_spawned(), 0);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let backend = MockDeviceBackend::new().with_frame_size(8, 8);
        let calls = backend.calls();
        let supervisor = supervisor(backend);

        assert_eq!(supervisor.handle_start(), StatusFrame::Starting);
        wait_for_state(&supervisor, PipelineState::Running).await;

        assert_eq!(supervisor.handle_stop(), StatusFrame::Stopping);
        wait_for_state(&supervisor, PipelineState::Idle).await;

        let counts = calls.snapshot();
        assert_eq!(counts.connect, 1);
        assert_eq!(counts.subscribe, 1);
        assert_eq!(counts.unsubscribe, 1);
        assert_eq!(counts.stop_streaming, 1);
        assert_eq!(counts.disconnect, 1);
    }

    #[tokio::test]
    async fn test_double_start_keeps_one_task() {
        let supervisor = supervisor(MockDeviceBackend::new().with_frame_size(8, 8));

        assert_eq!(supervisor.handle_start(), StatusFrame::Starting);
        wait_for_state(&supervisor, PipelineState::Running).await;
        assert_eq!(supervisor.handle_start(), StatusFrame::error(ALREADY_RUNNING));
        assert_eq!(supervisor.tasks_spawned(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_during_connect_cancels_startup() {
        let backend = MockDeviceBackend::new().with_connect_delay(Duration::from_secs(60));
        let calls = backend.calls();
        let supervisor = supervisor(backend);

        supervisor.handle_start();
        tokio::task::yield_now().await;
        assert_eq!(supervisor.handle_stop(), StatusFrame::Stopping);

        let exit = tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();
        assert_eq!(exit, Some(PipelineExit::Cancelled));
        assert_eq!(supervisor.state(), PipelineState::Idle);
        assert_eq!(calls.snapshot().disconnect, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_settles_in_failed() {
        let mut client = MockDeviceClient::new();
        client
            .expect_connect()
            .times(1)
            .returning(|_| Err(RelayError::Device("no device in range".to_string())));

        let supervisor = supervisor(client);
        supervisor.handle_start();
        supervisor.wait_for_completion().await;

        match supervisor.state() {
            PipelineState::Failed { reason } => assert!(reason.contains("no device in range")),
            other => panic!("unexpected state {:?}", other),
        }
        // A failed run does not block the next start
        assert_eq!(supervisor.handle_stop(), StatusFrame::error(NOT_RUNNING));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let backend = MockDeviceBackend::new().with_frame_size(8, 8);
        let calls = backend.calls();
        let supervisor = supervisor(backend);

        for _ in 0..2 {
            supervisor.handle_start();
            wait_for_state(&supervisor, PipelineState::Running).await;
            supervisor.handle_stop();
            supervisor.wait_for_completion().await;
        }

        assert_eq!(supervisor.tasks_spawned(), 2);
        assert_eq!(calls.snapshot().connect, 2);
        assert_eq!(calls.snapshot().disconnect, 2);
    }
}
