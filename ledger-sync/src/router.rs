//! Per-session fan-out of decoded envelopes to kind-scoped listeners.
//!
//! ```text
//!                    ┌── "invoice_updated" ──▸ [L1, L2]   (payload)
//!  Envelope ──▸ dispatch
//!                    └── "*" ─────────────────▸ [L3]       (full envelope)
//! ```
//!
//! Exact-kind listeners always run before wildcard listeners. Each call is
//! isolated: a panicking listener is logged and the rest still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

use crate::protocol::Envelope;

/// Kind under which a listener receives every envelope.
pub const WILDCARD: &str = "*";

/// Listener callback. Exact-kind listeners get the payload, wildcard
/// listeners get the full envelope with `type` included.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct RouterTable {
    next_id: u64,
    /// Registration order is preserved per kind.
    listeners: HashMap<String, Vec<(u64, Listener)>>,
}

impl RouterTable {
    fn remove(&mut self, kind: &str, id: u64) -> bool {
        let Some(entries) = self.listeners.get_mut(kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.listeners.remove(kind);
        }
        removed
    }
}

/// Listener table for one channel session. Cheap to clone; clones share
/// the same table.
#[derive(Clone, Default)]
pub struct EventRouter {
    table: Arc<Mutex<RouterTable>>,
}

impl EventRouter {
    /// Router with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` under `kind` (use [`WILDCARD`] for every kind).
    pub fn subscribe<F>(&self, kind: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut table = self.lock();
        table.next_id += 1;
        let id = table.next_id;
        table
            .listeners
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            table: Arc::downgrade(&self.table),
            kind,
            id,
            auto: false,
        }
    }

    /// Register a listener for every envelope.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(WILDCARD, listener)
    }

    /// Deliver one envelope. Returns how many listeners completed normally.
    ///
    /// The table lock is released before any listener runs, so listeners may
    /// subscribe or unsubscribe from inside a dispatch.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let (exact, wildcard) = {
            let table = self.lock();
            let snapshot = |kind: &str| -> Vec<Listener> {
                table
                    .listeners
                    .get(kind)
                    .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                    .unwrap_or_default()
            };
            let exact = if envelope.kind == WILDCARD {
                Vec::new()
            } else {
                snapshot(&envelope.kind)
            };
            (exact, snapshot(WILDCARD))
        };

        let mut delivered = 0;
        if !exact.is_empty() {
            let payload = envelope.payload_value();
            for listener in &exact {
                delivered += usize::from(invoke(&envelope.kind, listener, &payload));
            }
        }
        if !wildcard.is_empty() {
            let full = envelope.to_value();
            for listener in &wildcard {
                delivered += usize::from(invoke(&envelope.kind, listener, &full));
            }
        }
        delivered
    }

    /// Listeners registered under exactly `kind`.
    pub fn listener_count(&self, kind: &str) -> usize {
        self.lock().listeners.get(kind).map_or(0, Vec::len)
    }

    /// Kinds with at least one listener, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.lock().listeners.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Whether no listener is registered at all.
    pub fn is_empty(&self) -> bool {
        self.lock().listeners.is_empty()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.lock().listeners.clear();
    }
}

fn invoke(kind: &str, listener: &Listener, value: &Value) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| listener(value))) {
        Ok(()) => true,
        Err(cause) => {
            let reason = cause
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            log::error!("Listener for '{kind}' panicked: {reason}");
            false
        }
    }
}

/// Handle to one registration.
///
/// Dropping it keeps the listener registered unless it was turned into a
/// guard with [`Subscription::auto`].
pub struct Subscription {
    table: Weak<Mutex<RouterTable>>,
    kind: String,
    id: u64,
    auto: bool,
}

impl Subscription {
    /// Kind this registration listens for.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Unsubscribe automatically when this handle is dropped.
    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }

    /// Remove exactly this registration. Returns `false` if it was already
    /// gone (router cleared or dropped).
    pub fn unsubscribe(mut self) -> bool {
        self.auto = false;
        self.remove()
    }

    fn remove(&self) -> bool {
        match self.table.upgrade() {
            Some(table) => table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.kind, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.auto {
            self.remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("auto", &self.auto)
            .finish()
    }
}
