//! Command channel wire format.
//!
//! Inbound: text frames carrying `start` or `stop`, case-insensitive, with
//! surrounding whitespace ignored. Outbound: JSON status frames tagged by
//! `status`.

use crate::types::PipelineState;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const ALREADY_RUNNING: &str = "Application is already running.";
pub const NOT_RUNNING: &str = "Application is not running.";

/// Remote control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

/// Text that is not a known command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("start") {
            Ok(Command::Start)
        } else if trimmed.eq_ignore_ascii_case("stop") {
            Ok(Command::Stop)
        } else {
            Err(UnknownCommand(trimmed.to_string()))
        }
    }
}

/// Status frame sent to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusFrame {
    Starting,
    Stopping,
    Running,
    Stopped,
    Error { message: String },
}

impl StatusFrame {
    pub fn error(message: impl Into<String>) -> Self {
        StatusFrame::Error {
            message: message.into(),
        }
    }

    pub fn unknown_command(command: &UnknownCommand) -> Self {
        Self::error(format!("Unknown command: {}", command.0))
    }

    /// Unsolicited update for a state the supervisor has settled in.
    ///
    /// `Starting` and `Stopping` are already acknowledged by the command reply,
    /// so they produce nothing.
    pub fn for_state(state: &PipelineState) -> Option<Self> {
        match state {
            PipelineState::Running => Some(StatusFrame::Running),
            PipelineState::Idle => Some(StatusFrame::Stopped),
            PipelineState::Failed { reason } => Some(Self::error(reason.clone())),
            PipelineState::Starting | PipelineState::Stopping => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StatusFrame::Error { .. })
    }

    pub fn to_json(&self) -> String {
        // A tagged enum of strings always serializes
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"status":"error"}"#.to_string())
    }
}
