//! The single connected command-channel peer.
//!
//! [`PeerSlot`] holds at most one [`PeerHandle`]. A new connection replaces
//! the previous handle wholesale; once every clone of the old handle is gone,
//! its writer task closes the old socket.
//!
//! Outbound messages go through a bounded queue to a writer task that owns the
//! websocket sink, so neither the command loop nor the broadcaster ever holds
//! the socket across an await.

use crate::pipeline::nodes::ConsumerError;
use futures_util::{Sink, SinkExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Sending side of one peer connection
#[derive(Clone)]
pub struct PeerHandle {
    id: u64,
    addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer#{}({})", self.id, self.addr)
    }
}

impl PeerHandle {
    pub fn new(id: u64, addr: SocketAddr, tx: mpsc::Sender<Message>) -> Self {
        Self { id, addr, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a message, waiting at most `timeout` for queue space
    pub async fn send_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<(), ConsumerError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ConsumerError::Timeout(timeout),
                mpsc::error::SendTimeoutError::Closed(_) => ConsumerError::PeerGone,
            })
    }
}

/// Holder of the current peer, shared by the server and the broadcaster
#[derive(Clone)]
pub struct PeerSlot {
    current: Arc<watch::Sender<Option<PeerHandle>>>,
}

impl Default for PeerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerSlot").field(&*self.current.borrow()).finish()
    }
}

impl PeerSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            current: Arc::new(tx),
        }
    }

    /// The connected peer, if any
    pub fn current(&self) -> Option<PeerHandle> {
        self.current.borrow().clone()
    }

    /// Install a new peer, returning the one it replaced
    pub fn replace(&self, peer: PeerHandle) -> Option<PeerHandle> {
        self.current.send_replace(Some(peer))
    }

    /// Clear the slot if it still holds peer `id`
    pub fn clear(&self, id: u64) -> bool {
        self.current.send_if_modified(|current| {
            if current.as_ref().map(PeerHandle::id) == Some(id) {
                *current = None;
                true
            } else {
                false
            }
        })
    }

    /// Watch peer changes
    pub fn subscribe(&self) -> watch::Receiver<Option<PeerHandle>> {
        self.current.subscribe()
    }
}

/// Spawn the task that drains a peer's outbound queue into its socket.
///
/// The task ends, closing the sink, when every sender is dropped or a write
/// fails.
pub fn spawn_writer<S>(id: u64, mut sink: S, mut rx: mpsc::Receiver<Message>) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::debug!("Peer#{} write failed: {}", id, e);
                break;
            }
        }
        let _ = sink.close().await;
        tracing::trace!("Peer#{} writer finished", id);
    })
}
