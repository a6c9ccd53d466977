//! One duplex connection per channel key, recovered transparently.
//!
//! State machine:
//! ```text
//!            connect()              transport ok
//!   Idle ─────────────▸ Connecting ─────────────▸ Open
//!    ▲                    │   │                    │
//!    └── transport error ─┘   │ disconnect()       │ remote close / disconnect()
//!        (retry scheduled)    ▼                    ▼
//!                          Closing ──(late)──▸  Closed ──(auto, unless manual)──▸ Connecting
//! ```
//!
//! `connect()` never fails: a refused or broken transport resolves to
//! [`ConnectResult::Deferred`] and the [`ReconnectPolicy`] takes over. The
//! product keeps working on its last known state while the channel is down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::protocol::{ChannelKey, Envelope, FrameError};
use crate::router::{EventRouter, Subscription};
use crate::transport::Connector;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    /// Disconnected while a connect attempt was still in flight.
    Closing,
    Closed,
}

/// Outcome of [`ChannelSession::connect`]. There is no failure variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectResult {
    Connected,
    Deferred(DeferReason),
}

impl ConnectResult {
    /// Whether the channel opened.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// The transport could not be opened; a retry may be scheduled.
    Transport(String),
    /// `disconnect()` overtook the attempt.
    Cancelled,
}

/// Fixed-interval, bounded retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Retry every `interval`, at most `max_attempts` times.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Never retry automatically.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Whether another automatic attempt is allowed after `attempts` retries.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("channel is not open (state: {0:?})")]
    NotOpen(SessionState),

    #[error("outbound buffer is full")]
    Backpressure,

    #[error("transport closed")]
    Closed,

    #[error("payload must serialize to a JSON object: {0}")]
    Payload(String),
}

/// In-flight connect attempt, shared by every concurrent caller.
pub type PendingConnect = Shared<BoxFuture<'static, ConnectResult>>;

struct Link {
    state: SessionState,
    attempts: u32,
    manual_close: bool,
    /// Bumped by `disconnect()`; attempts and readers from an older
    /// generation must not touch the link.
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    pending: Option<PendingConnect>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct SessionInner {
    key: ChannelKey,
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    router: EventRouter,
    link: Mutex<Link>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionInner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, link: &mut Link, state: SessionState) {
        link.state = state;
        self.state_tx.send_replace(state);
    }

    async fn attempt(self: Arc<Self>, generation: u64) -> ConnectResult {
        log::debug!("Connecting channel {} ({})", self.key, self.url);
        let outcome = self.connector.connect(&self.url).await;

        let mut link = self.lock_link();
        if link.generation != generation || link.manual_close {
            if link.state == SessionState::Closing {
                self.set_state(&mut link, SessionState::Closed);
            }
            // A late connection is dropped here, which closes it.
            log::debug!("Connect attempt on {} overtaken by disconnect", self.key);
            return ConnectResult::Deferred(DeferReason::Cancelled);
        }
        link.pending = None;

        match outcome {
            Ok(connection) => {
                link.attempts = 0;
                link.outbound = Some(connection.outbound);
                link.reader = Some(tokio::spawn(Self::read_loop(
                    Arc::clone(&self),
                    connection.inbound,
                    generation,
                )));
                self.set_state(&mut link, SessionState::Open);
                log::info!("Channel {} open", self.key);
                ConnectResult::Connected
            }
            Err(e) => {
                log::warn!("Channel {} unavailable: {e}", self.key);
                self.set_state(&mut link, SessionState::Idle);
                Self::schedule_retry(&self, &mut link);
                ConnectResult::Deferred(DeferReason::Transport(e.to_string()))
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<String>, generation: u64) {
        while let Some(frame) = inbound.recv().await {
            self.ingest(&frame);
        }

        let mut link = self.lock_link();
        if link.generation != generation {
            return;
        }
        link.outbound = None;
        link.reader = None;
        self.set_state(&mut link, SessionState::Closed);
        log::info!("Channel {} closed by remote", self.key);
        Self::schedule_retry(&self, &mut link);
    }

    /// Decode one frame and hand it to the router, in arrival order.
    fn ingest(&self, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) => {
                self.router.dispatch(&envelope);
            }
            Err(FrameError::Malformed(e)) => {
                log::debug!("Ignoring unparsable frame on {}: {e}", self.key);
            }
            Err(e) => {
                log::warn!("Dropping frame on {}: {e}", self.key);
            }
        }
    }

    fn schedule_retry(inner: &Arc<Self>, link: &mut Link) {
        if link.manual_close {
            return;
        }
        if !inner.policy.allows(link.attempts) {
            log::warn!(
                "Channel {} giving up after {} reconnect attempts",
                inner.key,
                link.attempts
            );
            return;
        }
        link.attempts += 1;
        let generation = link.generation;
        let interval = inner.policy.interval;
        log::info!(
            "Reconnecting {} in {:.1}s (attempt {}/{})",
            inner.key,
            interval.as_secs_f32(),
            link.attempts,
            inner.policy.max_attempts
        );

        let weak: Weak<Self> = Arc::downgrade(inner);
        link.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut link = inner.lock_link();
                if link.generation != generation || link.manual_close {
                    return;
                }
                link.retry = None;
            }
            drop(ChannelSession { inner }.begin_connect());
        }));
    }
}

/// Handle to one channel connection. Clones share the same session.
#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    /// Build an idle session; nothing connects until [`Self::connect`].
    pub fn new(
        key: ChannelKey,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                key,
                url: url.into(),
                connector,
                policy,
                router: EventRouter::new(),
                link: Mutex::new(Link {
                    state: SessionState::Idle,
                    attempts: 0,
                    manual_close: false,
                    generation: 0,
                    outbound: None,
                    pending: None,
                    reader: None,
                    retry: None,
                }),
                state_tx,
            }),
        }
    }

    /// Channel this session serves.
    pub fn key(&self) -> &ChannelKey {
        &self.inner.key
    }

    /// Transport URL every attempt dials.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Retry policy for unexpected closes.
    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock_link().state
    }

    /// Whether frames can be sent right now.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Automatic retries used since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_link().attempts
    }

    /// Whether a reconnect timer is armed.
    pub fn reconnect_pending(&self) -> bool {
        self.inner.lock_link().retry.is_some()
    }

    /// Listener table fed by this session's inbound frames.
    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Same session object (not just the same key).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Listen for one envelope kind; the listener gets the payload.
    pub fn subscribe<F>(&self, kind: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(kind, listener)
    }

    /// Listen for every envelope; the listener gets the full frame.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_all(listener)
    }

    /// Start connecting (or join the attempt already in flight) without
    /// waiting. The attempt runs as its own task, so dropping the returned
    /// future does not cancel it. Must be called within a Tokio runtime.
    pub fn begin_connect(&self) -> PendingConnect {
        let mut link = self.inner.lock_link();
        match link.state {
            SessionState::Open => {
                return futures_util::future::ready(ConnectResult::Connected)
                    .boxed()
                    .shared();
            }
            SessionState::Connecting => {
                if let Some(pending) = &link.pending {
                    return pending.clone();
                }
            }
            _ => {}
        }

        link.manual_close = false;
        if let Some(retry) = link.retry.take() {
            retry.abort();
        }
        self.inner.set_state(&mut link, SessionState::Connecting);

        let generation = link.generation;
        let handle = tokio::spawn(SessionInner::attempt(Arc::clone(&self.inner), generation));
        let pending: PendingConnect = async move {
            handle
                .await
                .unwrap_or(ConnectResult::Deferred(DeferReason::Cancelled))
        }
        .boxed()
        .shared();
        link.pending = Some(pending.clone());
        pending
    }

    /// Connect and wait until the channel is open or the attempt is
    /// deferred. Concurrent callers share one attempt.
    pub async fn connect(&self) -> ConnectResult {
        self.begin_connect().await
    }

    /// Close for good: no automatic reconnect afterwards.
    ///
    /// Idempotent. Cancels a pending retry, closes the transport (or lets an
    /// in-flight attempt close its connection when it lands), and clears all
    /// listeners.
    pub fn disconnect(&self) {
        let previous = {
            let mut link = self.inner.lock_link();
            let previous = link.state;
            link.manual_close = true;
            link.generation += 1;
            link.pending = None;
            link.outbound = None;
            if let Some(retry) = link.retry.take() {
                retry.abort();
            }
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            let next = match previous {
                SessionState::Connecting | SessionState::Closing => SessionState::Closing,
                _ => SessionState::Closed,
            };
            self.inner.set_state(&mut link, next);
            previous
        };
        self.inner.router.clear();
        if !matches!(previous, SessionState::Closed | SessionState::Closing) {
            log::info!("Channel {} disconnected", self.inner.key);
        }
    }

    /// Fire-and-forget send of `{type: kind, ...payload}`.
    pub fn send(&self, kind: &str, payload: Map<String, Value>) -> Result<(), SessionError> {
        let link = self.inner.lock_link();
        let outbound = match (&link.outbound, link.state) {
            (Some(outbound), SessionState::Open) => outbound,
            _ => return Err(SessionError::NotOpen(link.state)),
        };
        outbound
            .try_send(Envelope::new(kind, payload).encode())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
            })
    }

    /// Send a typed payload; it must serialize to an object (or unit).
    pub fn send_json<T: Serialize>(&self, kind: &str, payload: &T) -> Result<(), SessionError> {
        match serde_json::to_value(payload).map_err(|e| SessionError::Payload(e.to_string()))? {
            Value::Object(map) => self.send(kind, map),
            Value::Null => self.send(kind, Map::new()),
            other => Err(SessionError::Payload(format!("got {other}"))),
        }
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("key", &self.inner.key)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}
