//! # ledger-sync: Real-time sync layer for the ledger back office
//!
//! Keeps client-side record collections consistent with the server by
//! combining REST fetches, confirmed mutations and pushed deltas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  get_or_create  ┌──────────────────┐   duplex    ┌────────┐
//! │ ResourceCache    │ ──────────────► │ ConnectionRegistry│ ──────────► │ server │
//! │ (per endpoint)   │                 │ (one per key)     │  (ws push)  └───┬────┘
//! └───────┬──────────┘                 └────────┬──────────┘                 │
//!         │ list/create/update/delete           ▼                            │
//!         ▼                            ┌──────────────────┐  frames          │
//! ┌──────────────────┐                 │ ChannelSession   │ ◄────────────────┘
//! │ ResourceApi      │                 │ (retry machine)  │
//! │ (HTTP, cookies)  │                 └────────┬─────────┘
//! └──────────────────┘                          ▼
//!                                      ┌──────────────────┐
//!                                      │ EventRouter      │──► cache, notifications
//!                                      │ (kind → listeners)│
//!                                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Channel keys, resource ids, JSON envelopes
//! - [`transport`]: Connector seam (WebSocket and in-memory)
//! - [`session`]: One duplex channel with bounded reconnect
//! - [`router`]: Kind-keyed listener fan-out with wildcard
//! - [`registry`]: Deduplicated sessions per channel key
//! - [`api`]: Request/response backend for a resource endpoint
//! - [`cache`]: Reconciled per-endpoint collection
//! - [`notify`]: Push kinds projected into user-facing alerts

pub mod api;
pub mod cache;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use api::{ApiError, FetchParams, HttpConfig, HttpResourceApi, ResourceApi};
pub use cache::{CacheConfig, CacheError, CacheSnapshot, Pagination, PushDelta, ResourceCache};
pub use notify::{Notification, NotificationProjector, Severity};
pub use protocol::{ChannelKey, Envelope, FrameError, ResourceId};
pub use registry::{ConnectionRegistry, RegistryConfig};
pub use router::{EventRouter, Subscription, WILDCARD};
pub use session::{
    ChannelSession, ConnectResult, DeferReason, ReconnectPolicy, SessionError, SessionState,
};
pub use transport::{Connection, Connector, MemoryConnector, MemoryPeer, TransportError, WsConnector};
