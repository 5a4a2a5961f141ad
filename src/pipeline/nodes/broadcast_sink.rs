//! BroadcastForwarder: sends preview frames to the command-channel peer.
//!
//! Frames are JPEG-encoded and sent as binary websocket messages to whichever
//! peer is connected at that moment. With no peer connected the frame is
//! skipped.

use super::{encode_jpeg, Consumer, ConsumerError, ConsumerFactory, ConsumerPolicy};
use crate::config::BroadcastSettings;
use crate::pipeline::event::{Event, Topic};
use crate::server::PeerSlot;
use async_trait::async_trait;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

/// Consumer that pushes preview frames to the connected peer
pub struct BroadcastForwarder {
    peers: PeerSlot,
    topic: Topic,
    send_timeout: Duration,
    jpeg_quality: u8,
    skipped: u64,
}

impl BroadcastForwarder {
    pub fn new(peers: PeerSlot, settings: &BroadcastSettings) -> Self {
        Self {
            peers,
            topic: Topic::PREVIEW,
            send_timeout: settings.send_timeout(),
            jpeg_quality: settings.jpeg_quality,
            skipped: 0,
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    pub fn factory(peers: PeerSlot, settings: &BroadcastSettings) -> impl ConsumerFactory {
        let settings = settings.clone();
        move || -> Box<dyn Consumer> { Box::new(Self::new(peers.clone(), &settings)) }
    }

    /// Frames dropped because no peer was connected
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[async_trait]
impl Consumer for BroadcastForwarder {
    fn name(&self) -> &str {
        "BroadcastForwarder"
    }

    fn topic(&self) -> Topic {
        self.topic.clone()
    }

    fn policy(&self) -> ConsumerPolicy {
        ConsumerPolicy {
            call_timeout: Some(self.send_timeout * 2),
            backoff: Duration::ZERO,
        }
    }

    async fn handle(&mut self, event: Event) -> Result<(), ConsumerError> {
        let Some(frame) = event.payload().frame() else {
            return Err(ConsumerError::UnexpectedPayload(event.topic().clone()));
        };

        let Some(peer) = self.peers.current() else {
            self.skipped += 1;
            tracing::trace!("No peer connected, skipping sample {}", frame.sample_index);
            return Ok(());
        };

        let jpeg = encode_jpeg(&frame.image, self.jpeg_quality)?;
        peer.send_timeout(Message::binary(jpeg), self.send_timeout).await
    }
}
