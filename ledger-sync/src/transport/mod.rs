//! Transport seam between a [`ChannelSession`](crate::session::ChannelSession)
//! and the socket underneath it.
//!
//! A [`Connection`] is a pair of channels. Dropping `outbound` closes the
//! transport; `inbound` ending means the remote side went away.
//!
//! - [`ws`]: WebSocket connector (tokio-tungstenite)
//! - [`memory`]: in-process connector for tests and offline demos

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::{MemoryConnector, MemoryPeer};
pub use ws::WsConnector;

/// Frames buffered per direction before senders see backpressure.
pub const CHANNEL_CAPACITY: usize = 256;

/// Transport-level failures. Never surfaced to `connect()` callers as errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("connection refused by {0}")]
    Refused(String),
}

/// An open duplex link.
#[derive(Debug)]
pub struct Connection {
    /// Text frames to write to the remote side.
    pub outbound: mpsc::Sender<String>,
    /// Text frames read from the remote side.
    pub inbound: mpsc::Receiver<String>,
}

/// Opens connections to channel URLs.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}
