//! Events carried by the bus.
//!
//! An [`Event`] is an immutable `{topic, payload}` envelope. Frame payloads are
//! reference counted so that one sampled frame can be published to several
//! topics without copying the pixels.

use crate::pipeline::id::SessionId;
use crate::types::{FrameSample, StreamingErrorCode};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Name of a logical event stream.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Cow<'static, str>);

impl Topic {
    /// Sampled frames for the inference forwarder.
    pub const FRAME: Topic = Topic(Cow::Borrowed("frame"));
    /// Sampled frames for the websocket broadcaster.
    pub const PREVIEW: Topic = Topic(Cow::Borrowed("preview"));
    /// Fatal failures reported by the streaming client.
    pub const STREAM_FAILURE: Topic = Topic(Cow::Borrowed("stream_failure"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Topic {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topic-defined event body.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A sampled, transformed camera frame from one run
    Frame {
        session: SessionId,
        sample: Arc<FrameSample>,
    },
    /// The streaming client reported a fatal failure
    StreamFailure {
        session: SessionId,
        code: StreamingErrorCode,
        message: String,
    },
}

impl Payload {
    /// The frame carried by this payload, if any
    pub fn frame(&self) -> Option<&Arc<FrameSample>> {
        match self {
            Payload::Frame { sample, .. } => Some(sample),
            _ => None,
        }
    }

    /// The pipeline run that produced this payload
    pub fn session(&self) -> SessionId {
        match self {
            Payload::Frame { session, .. } | Payload::StreamFailure { session, .. } => *session,
        }
    }
}

/// Immutable envelope published on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    topic: Topic,
    payload: Payload,
}

impl Event {
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self { topic, payload }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}
