//! Keyed store of channel sessions: at most one live session per key.
//!
//! The registry is an ordinary service object rather than a process-wide
//! static, so each test (or each app shell) owns an isolated one. Build it
//! at startup, hand clones to whoever needs channels, and call
//! [`ConnectionRegistry::close_all`] at teardown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::protocol::ChannelKey;
use crate::session::{ChannelSession, ReconnectPolicy};
use crate::transport::{Connector, WsConnector};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Duplex endpoint base; channel paths are appended to it.
    pub ws_base_url: String,
    /// Retry policy handed to every session.
    pub reconnect: ReconnectPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://127.0.0.1:8000/ws".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Channel key → shared session.
#[derive(Clone)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<ChannelKey, ChannelSession>>>,
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Empty registry dialing through `connector`.
    pub fn new(config: RegistryConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            connector,
            config,
        }
    }

    /// Registry backed by real WebSocket connections.
    pub fn with_websockets(config: RegistryConfig) -> Self {
        Self::new(config, Arc::new(WsConnector::default()))
    }

    /// Configuration handed to every new session.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the session for `key`, creating it on first use.
    ///
    /// A new session starts connecting in the background; the caller does
    /// not wait for it and never sees a connection failure.
    pub async fn get_or_create(&self, key: &ChannelKey) -> ChannelSession {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(key) {
            return session.clone();
        }

        let session = ChannelSession::new(
            key.clone(),
            key.url(&self.config.ws_base_url),
            Arc::clone(&self.connector),
            self.config.reconnect,
        );
        drop(session.begin_connect());
        sessions.insert(key.clone(), session.clone());
        log::debug!("Registered channel {key}");
        session
    }

    /// Existing session for `key`, without creating one.
    pub async fn get(&self, key: &ChannelKey) -> Option<ChannelSession> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Disconnect and forget the session for `key`. Returns whether one existed.
    pub async fn close(&self, key: &ChannelKey) -> bool {
        let removed = self.sessions.write().await.remove(key);
        match removed {
            Some(session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }

    /// Close the session for `key` only if nobody listens on it any more.
    pub async fn release(&self, key: &ChannelKey) -> bool {
        let mut sessions = self.sessions.write().await;
        let idle = sessions
            .get(key)
            .is_some_and(|session| session.router().is_empty());
        if !idle {
            return false;
        }
        if let Some(session) = sessions.remove(key) {
            session.disconnect();
        }
        true
    }

    /// Disconnect every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<ChannelSession> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            session.disconnect();
        }
        if !drained.is_empty() {
            log::info!("Closed {} channel(s)", drained.len());
        }
        drained.len()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Whether a session is registered for `key`.
    pub async fn contains(&self, key: &ChannelKey) -> bool {
        self.sessions.read().await.contains_key(key)
    }

    /// Keys of every registered session, unordered.
    pub async fn keys(&self) -> Vec<ChannelKey> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
