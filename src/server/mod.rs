//! Websocket command channel.
//!
//! A single remote peer sends `start`/`stop` text commands and receives JSON
//! status frames. A new connection silently replaces the previous peer. Besides
//! command replies, the peer receives an unsolicited frame whenever the
//! pipeline settles in `Running`, `Idle` or `Failed`, and binary JPEG previews
//! from the broadcast forwarder.
//!
//! Websocket handshakes run in their own tasks. The command loop only sees a
//! connection once its handshake has completed, so a client that connects and
//! never upgrades cannot hold up replies to the attached peer.

pub mod peer;
pub mod protocol;

pub use peer::{spawn_writer, PeerHandle, PeerSlot};
pub use protocol::{Command, StatusFrame, UnknownCommand, ALREADY_RUNNING, NOT_RUNNING};

use crate::config::ServerSettings;
use crate::error::{RelayError, Result, ResultExt};
use crate::pipeline::Supervisor;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// How long a status frame may wait for room in the peer's outbound queue
const STATUS_SEND_TIMEOUT: Duration = Duration::from_secs(1);

type PeerReader = SplitStream<WebSocketStream<TcpStream>>;

/// Outcome of one handshake task
type Handshake = (SocketAddr, Result<WebSocketStream<TcpStream>>);

/// The peer currently attached to the command loop
struct Connection {
    peer: PeerHandle,
    reader: PeerReader,
}

/// Listener and command loop for the command channel
pub struct CommandServer {
    listener: TcpListener,
    supervisor: Supervisor,
    peers: PeerSlot,
    settings: ServerSettings,
    next_peer_id: u64,
}

impl CommandServer {
    /// Bind the listening socket
    pub async fn bind(
        settings: &ServerSettings,
        supervisor: Supervisor,
        peers: PeerSlot,
    ) -> Result<Self> {
        let address = settings.socket_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(RelayError::Io)
            .with_context(|| format!("Failed to bind command channel on {}", address))?;
        tracing::info!("Command channel listening on {}", address);

        Ok(Self {
            listener,
            supervisor,
            peers,
            settings: settings.clone(),
            next_peer_id: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut state_rx = self.supervisor.subscribe_state();
        state_rx.borrow_and_update();
        let mut connection: Option<Connection> = None;
        let mut handshakes: JoinSet<Handshake> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("Connection from {}, awaiting handshake", addr);
                        let timeout = self.settings.handshake_timeout();
                        handshakes.spawn(async move {
                            (addr, handshake(stream, addr, timeout).await)
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },

                Some(finished) = handshakes.join_next() => match finished {
                    Ok((addr, Ok(socket))) => {
                        let accepted = self.attach_peer(socket, addr);
                        if let Some(previous) = connection.replace(accepted) {
                            tracing::info!("{:?} replaced by a new connection", previous.peer);
                        }
                    }
                    Ok((addr, Err(e))) => {
                        tracing::warn!("Dropping connection from {}: {}", addr, e)
                    }
                    Err(e) => tracing::warn!("Handshake task failed: {}", e),
                },

                message = next_message(&mut connection) => {
                    if !self.on_message(&connection, message).await {
                        if let Some(closed) = connection.take() {
                            self.peers.clear(closed.peer.id());
                            tracing::info!("{:?} disconnected", closed.peer);
                        }
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Pipeline state channel closed");
                        break;
                    }
                    let state = state_rx.borrow_and_update().clone();
                    tracing::debug!("Pipeline state: {}", state);
                    if let Some(frame) = StatusFrame::for_state(&state) {
                        self.notify(frame).await;
                    }
                }
            }
        }

        handshakes.shutdown().await;
        if let Some(closed) = connection.take() {
            self.peers.clear(closed.peer.id());
        }
        tracing::info!("Command channel stopped");
        Ok(())
    }

    /// Install a freshly upgraded socket as the current peer
    fn attach_peer(&mut self, socket: WebSocketStream<TcpStream>, addr: SocketAddr) -> Connection {
        self.next_peer_id += 1;
        let id = self.next_peer_id;
        let (sink, reader) = socket.split();
        let (tx, rx) = mpsc::channel(self.settings.outbound_queue.max(1));
        spawn_writer(id, sink, rx);

        let peer = PeerHandle::new(id, addr, tx);
        self.peers.replace(peer.clone());
        tracing::info!("{:?} connected", peer);
        Connection { peer, reader }
    }

    /// Handle one inbound item; returns false once the peer is gone
    async fn on_message(
        &self,
        connection: &Option<Connection>,
        message: Option<std::result::Result<Message, tungstenite::Error>>,
    ) -> bool {
        let Some(connection) = connection else {
            return false;
        };
        let peer = &connection.peer;

        match message {
            Some(Ok(Message::Text(text))) => {
                let reply = match text.parse::<Command>() {
                    Ok(Command::Start) => self.supervisor.handle_start(),
                    Ok(Command::Stop) => self.supervisor.handle_stop(),
                    Err(unknown) => {
                        tracing::debug!("{:?} sent unknown command {:?}", peer, unknown.0);
                        StatusFrame::unknown_command(&unknown)
                    }
                };
                send_status(peer, reply).await
            }
            Some(Ok(Message::Close(_))) | None => false,
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                tracing::debug!("{:?} read failed: {}", peer, e);
                false
            }
        }
    }

    async fn notify(&self, frame: StatusFrame) {
        if let Some(peer) = self.peers.current() {
            send_status(&peer, frame).await;
        }
    }
}

/// Upgrade an accepted TCP stream, giving up after `timeout`
async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<WebSocketStream<TcpStream>> {
    match tokio::time::timeout(timeout, tokio_tungstenite::accept_async(stream)).await {
        Ok(upgraded) => upgraded
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))
            .with_context(|| format!("Websocket handshake with {} failed", addr)),
        Err(_) => Err(RelayError::Timeout(format!(
            "websocket handshake with {} took longer than {:?}",
            addr, timeout
        ))),
    }
}

/// Next message from the attached peer; pending while none is attached
async fn next_message(
    connection: &mut Option<Connection>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match connection {
        Some(connection) => connection.reader.next().await,
        None => std::future::pending().await,
    }
}

async fn send_status(peer: &PeerHandle, frame: StatusFrame) -> bool {
    match peer
        .send_timeout(Message::text(frame.to_json()), STATUS_SEND_TIMEOUT)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to send status to {:?}: {}", peer, e);
            !peer.is_closed()
        }
    }
}
