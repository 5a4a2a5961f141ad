//! Pipeline-specific error types.

use crate::pipeline::event::Topic;
use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The scheduler side of the handoff is gone (runtime shutting down)
    #[error("Handoff closed: scheduler is no longer accepting events")]
    HandoffClosed,

    /// A bounded topic queue is full; the new event was dropped
    #[error("Queue for topic {topic} is full")]
    QueueFull { topic: Topic },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
