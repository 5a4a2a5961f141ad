//! Mock construction helpers

use async_trait::async_trait;
use aria_relay::backend::MockDeviceBackend;
use aria_relay::pipeline::{Consumer, ConsumerError, ConsumerPolicy, Event, Topic};
use aria_relay::server::StatusFrame;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type TestSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A simulated device producing small frames quickly
pub fn fast_backend() -> MockDeviceBackend {
    MockDeviceBackend::new()
        .with_frame_rate(200)
        .with_frame_size(8, 6)
}

/// Consumer that reports every event it sees and fails the first `failures`
pub struct RecordingConsumer {
    topic: Topic,
    failures: u32,
    delay: Duration,
    seen: mpsc::UnboundedSender<Event>,
}

impl RecordingConsumer {
    pub fn new(topic: Topic) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (
            Self {
                topic,
                failures: 0,
                delay: Duration::ZERO,
                seen,
            },
            rx,
        )
    }

    /// Report into an existing channel, so consumers built per run share it
    pub fn reporting_to(topic: Topic, seen: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            topic,
            failures: 0,
            delay: Duration::ZERO,
            seen,
        }
    }

    pub fn failing_first(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    /// Spend `delay` on every event after reporting it
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    fn name(&self) -> &str {
        "RecordingConsumer"
    }

    fn topic(&self) -> Topic {
        self.topic.clone()
    }

    fn policy(&self) -> ConsumerPolicy {
        ConsumerPolicy {
            call_timeout: Some(Duration::from_secs(1)),
            backoff: Duration::from_millis(10),
        }
    }

    async fn handle(&mut self, event: Event) -> Result<(), ConsumerError> {
        let _ = self.seen.send(event);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(ConsumerError::Unreachable("injected failure".to_string()));
        }
        Ok(())
    }
}

/// Connect a websocket client to the command channel
pub async fn connect(addr: std::net::SocketAddr) -> TestSocket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .expect("connect to command channel");
    socket
}

/// Next status frame, skipping binary previews
pub async fn next_status(socket: &mut TestSocket) -> StatusFrame {
    loop {
        let message = tokio::time::timeout(super::test_timeout(), socket.next())
            .await
            .expect("timed out waiting for a status frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("status frame json")
            }
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {:?}", other),
        }
    }
}

/// Send a text command
pub async fn send_command(socket: &mut TestSocket, command: &str) {
    futures_util::SinkExt::send(socket, Message::text(command))
        .await
        .expect("send command");
}
