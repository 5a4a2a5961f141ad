//! Built-in consumers and the contract they satisfy.
//!
//! A [`Consumer`] subscribes to exactly one topic and performs one external
//! side effect per event. Consumers never share mutable state with each other
//! and never end the pipeline: every per-event failure is logged by
//! [`run_consumer`], which backs off after transient errors and carries on.
//!
//! Consumers are built fresh for every pipeline run from a
//! [`ConsumerFactory`], and cancelled and joined by the run's teardown. A
//! consumer only handles events produced by its own run; anything an earlier
//! run left queued on the topic is skipped.

pub mod broadcast_sink;
pub mod inference_sink;
pub mod jpeg;

pub use broadcast_sink::BroadcastForwarder;
pub use inference_sink::InferenceForwarder;
pub use jpeg::encode_jpeg;

use crate::pipeline::bus::{EventBus, Subscription};
use crate::pipeline::event::{Event, Topic};
use crate::pipeline::id::SessionId;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-event failure of a consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The remote service could not be reached
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    /// The external call did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The remote service answered with a non-success status
    #[error("Rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// The peer's connection closed while sending
    #[error("Peer disconnected")]
    PeerGone,

    /// The event carried a payload this consumer does not handle
    #[error("Unexpected payload on topic {0}")]
    UnexpectedPayload(Topic),
}

impl ConsumerError {
    /// Whether the runner should back off before the next event
    pub fn is_transient(&self) -> bool {
        matches!(self, ConsumerError::Unreachable(_) | ConsumerError::Timeout(_))
    }
}

/// Timing policy applied by [`run_consumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerPolicy {
    /// Upper bound on one `handle` call; unbounded when `None`
    pub call_timeout: Option<Duration>,
    /// Pause after a transient failure
    pub backoff: Duration,
}

impl Default for ConsumerPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(10)),
            backoff: Duration::ZERO,
        }
    }
}

/// A downstream worker fed from one topic.
#[async_trait]
pub trait Consumer: Send {
    fn name(&self) -> &str;

    fn topic(&self) -> Topic;

    fn policy(&self) -> ConsumerPolicy {
        ConsumerPolicy::default()
    }

    /// Perform the side effect for one event
    async fn handle(&mut self, event: Event) -> Result<(), ConsumerError>;
}

/// Builds a fresh consumer for each pipeline run
pub trait ConsumerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Consumer>;
}

impl<F> ConsumerFactory for F
where
    F: Fn() -> Box<dyn Consumer> + Send + Sync,
{
    fn create(&self) -> Box<dyn Consumer> {
        self()
    }
}

/// What a consumer did before it was stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub handled: u64,
    pub failed: u64,
    /// Events from another run, skipped without calling the consumer
    pub stale: u64,
}

async fn call(
    consumer: &mut dyn Consumer,
    event: Event,
    timeout: Option<Duration>,
) -> Result<(), ConsumerError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, consumer.handle(event))
            .await
            .map_err(|_| ConsumerError::Timeout(limit))?,
        None => consumer.handle(event).await,
    }
}

/// Drive a consumer until `cancel` fires or its subscription ends.
///
/// Cancellation is observed while waiting for an event, during the external
/// call and during backoff. Events tagged with a session other than `session`
/// are counted as stale and dropped.
pub async fn run_consumer(
    mut consumer: Box<dyn Consumer>,
    mut events: Subscription,
    session: SessionId,
    cancel: CancellationToken,
) -> ConsumerStats {
    let policy = consumer.policy();
    let name = consumer.name().to_string();
    let mut stats = ConsumerStats::default();
    tracing::debug!("Consumer {} listening on {}", name, consumer.topic());

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => match next {
                Some(event) => event,
                None => break,
            },
        };

        if event.payload().session() != session {
            stats.stale += 1;
            tracing::trace!(
                "{}: skipping event from session {} on {}",
                name,
                event.payload().session(),
                event.topic()
            );
            continue;
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = call(consumer.as_mut(), event, policy.call_timeout) => outcome,
        };

        match outcome {
            Ok(()) => stats.handled += 1,
            Err(e) => {
                stats.failed += 1;
                if e.is_transient() && !policy.backoff.is_zero() {
                    tracing::warn!("{}: {}; pausing for {:?}", name, e, policy.backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(policy.backoff) => {}
                    }
                } else {
                    tracing::warn!("{}: {}", name, e);
                }
            }
        }
    }

    tracing::debug!(
        "Consumer {} stopped ({} handled, {} failed, {} stale)",
        name,
        stats.handled,
        stats.failed,
        stats.stale
    );
    stats
}

/// Subscribe a consumer to its topic and run it as its own task for `session`
pub fn spawn_consumer(
    consumer: Box<dyn Consumer>,
    bus: &EventBus,
    session: SessionId,
    cancel: CancellationToken,
) -> JoinHandle<ConsumerStats> {
    let events = bus.subscribe(consumer.topic());
    tokio::spawn(run_consumer(consumer, events, session, cancel))
}
