//! Event routing and task supervision.
//!
//! Frames arrive on the device driver's thread, cross into the scheduler
//! through a handoff, and are routed by topic to independent consumers. The
//! supervisor owns the run that connects the device and keeps this flowing.
//!
//! # Architecture
//!
//! ```text
//! driver thread                 scheduler
//! ─────────────                 ─────────────────────────────────────────
//! [CallbackBridge] ──Handoff──► [EventBus] ─frame───► [InferenceForwarder]
//!                                         ├─preview─► [BroadcastForwarder]
//!                                         └─stream_failure─► [PipelineTask]
//!
//! [CommandServer] ──start/stop──► [Supervisor] ──spawns──► [PipelineTask]
//! ```
//!
//! # Design
//!
//! - **Work-queue topics**: subscribers of one topic compete for its events.
//!   A frame meant for two consumers is published to two topics.
//! - **Single entry from foreign threads**: only [`Handoff::post`] may be
//!   called off the scheduler.
//! - **Scoped teardown**: a connected device is owned by a [`DeviceSession`]
//!   and released exactly once on every exit path.

pub mod bridge;
pub mod bus;
pub mod error;
pub mod event;
pub mod id;
pub mod nodes;
pub mod supervisor;
pub mod task;

pub use bridge::{BridgeStats, CallbackBridge};
pub use bus::{EventBus, Handoff, HandoffPump, Subscription, TopicStats};
pub use error::{PipelineError, PipelineResult};
pub use event::{Event, Payload, Topic};
pub use id::{SessionId, SessionIdAllocator};
pub use nodes::{
    run_consumer, spawn_consumer, BroadcastForwarder, Consumer, ConsumerError, ConsumerFactory,
    ConsumerPolicy, ConsumerStats, InferenceForwarder,
};
pub use supervisor::Supervisor;
pub use task::{DeviceSession, PipelineExit, PipelineTask};
