//! In-process connector.
//!
//! Every accepted connection hands its remote end to the test as a
//! [`MemoryPeer`], which can push frames to the client and read what the
//! client sent. The connector can be switched between accepting and
//! refusing at any time, and can delay its answer to model slow handshakes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connection, Connector, TransportError, CHANNEL_CAPACITY};
use crate::protocol::Envelope;

#[derive(Debug, Default)]
struct MemoryState {
    refusing: bool,
    delay: Option<Duration>,
    urls: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl MemoryConnector {
    /// A connector that accepts every connection.
    pub fn accepting() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            peers_tx,
            peers_rx: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// A connector that refuses every connection.
    pub fn refusing() -> Self {
        let connector = Self::accepting();
        connector.set_refusing(true);
        connector
    }

    /// Answer each connect only after `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch between refusing and accepting new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    /// Number of connect attempts seen so far.
    pub fn attempts(&self) -> usize {
        self.lock().urls.len()
    }

    /// URLs of every connect attempt, in order.
    pub fn urls(&self) -> Vec<String> {
        self.lock().urls.clone()
    }

    /// Wait for the next accepted connection.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.urls.push(url.to_owned());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().refusing {
            return Err(TransportError::Refused(url.to_owned()));
        }

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let peer = MemoryPeer {
            url: url.to_owned(),
            to_client: in_tx,
            from_client: out_rx,
        };
        // The receiver lives as long as any clone of the connector.
        let _ = self.peers_tx.send(peer);

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Remote end of an in-memory connection. Dropping it closes the link
/// from the server side.
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: String,
    to_client: mpsc::Sender<String>,
    from_client: mpsc::Receiver<String>,
}

impl MemoryPeer {
    /// Push a raw frame to the client. `false` once the client is gone.
    pub async fn push(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).await.is_ok()
    }

    /// Push an encoded envelope to the client.
    pub async fn push_envelope(&self, envelope: &Envelope) -> bool {
        self.push(envelope.encode()).await
    }

    /// Next frame sent by the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Whether the client side has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }
}
