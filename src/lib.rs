//! # aria-relay: sensor stream relay
//!
//! Bridges a wearable sensor device's callback-driven frame stream into an
//! async process that forwards sampled frames to independent consumers, with
//! start/stop controlled remotely over a websocket command channel.
//!
//! ## Architecture
//!
//! - **Backend**: the device driver seam ([`backend::DeviceClient`],
//!   [`backend::Device`]) plus a simulated driver and the pairing helper
//! - **Pipeline**: the callback bridge, the topic-routed event bus, the
//!   consumers and the supervisor that owns each run
//! - **Server**: the websocket command channel with its single peer
//! - **Communication**: a handoff channel is the only way driver threads
//!   reach the async side
//!
//! ## Configuration
//!
//! Settings come from one TOML file; see [`config`] for how it is located.
//!
//! ## Example
//!
//! ```ignore
//! use aria_relay::{
//!     backend::MockDeviceBackend,
//!     config::RelayConfig,
//!     pipeline::{EventBus, Supervisor},
//!     server::{CommandServer, PeerSlot},
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> aria_relay::Result<()> {
//!     let config = RelayConfig::default();
//!     let client = Arc::new(MockDeviceBackend::from_settings(&config.simulator));
//!     let bus = EventBus::with_settings(&config.bus);
//!     let supervisor = Supervisor::new(client, bus, config.pipeline_settings());
//!
//!     let peers = PeerSlot::new();
//!     let server = CommandServer::bind(&config.server, supervisor.clone(), peers).await?;
//!     server.run(CancellationToken::new()).await?;
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use backend::{Device, DeviceClient, StreamObserver};
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use pipeline::{EventBus, Supervisor};
pub use server::{CommandServer, PeerSlot};
