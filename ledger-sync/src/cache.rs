//! One consistent, mutable collection per resource endpoint.
//!
//! Three writers feed the same collection:
//!
//! ```text
//!   fetch()  ──── bulk snapshot ────┐
//!   create/update/remove ─ confirmed ┼──▸ CacheState (one item per id)
//!   push delta (router listener) ───┘
//! ```
//!
//! There is no ordering between the three sources: whichever result
//! arrives last is applied last. A push `updated` that lands while a
//! `fetch()` is in flight can be overwritten by the older snapshot when
//! the fetch completes. That is accepted for a UI cache; nothing here
//! compares timestamps or versions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::api::{ApiError, FetchParams, ResourceApi};
use crate::protocol::{ChannelKey, Envelope, ResourceId};
use crate::registry::ConnectionRegistry;
use crate::router::Subscription;
use crate::session::ChannelSession;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("cache for '{0}' has been disposed")]
    Disposed(String),
}

/// Pagination metadata from an enveloped list response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    #[serde(alias = "current_page")]
    pub page: Option<u64>,
    #[serde(alias = "page_size", alias = "limit")]
    pub per_page: Option<u64>,
    #[serde(alias = "count")]
    pub total: Option<u64>,
    #[serde(alias = "pages", alias = "last_page")]
    pub total_pages: Option<u64>,
}

/// What a consumer renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub items: Vec<Value>,
    pub loading: bool,
    pub error: Option<String>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Endpoint path relative to the API base, e.g. `customers`.
    pub endpoint: String,
    /// Push channel feeding this collection, if any.
    pub channel: Option<ChannelKey>,
    /// Load the collection when the cache is opened.
    pub auto_fetch: bool,
    pub initial_params: FetchParams,
    /// Push kinds that neither merge nor trigger a refresh.
    pub ignored_kinds: HashSet<String>,
}

impl CacheConfig {
    /// Auto-fetching config with no channel.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            channel: None,
            auto_fetch: true,
            initial_params: FetchParams::default(),
            ignored_kinds: HashSet::new(),
        }
    }

    /// Follow pushes from `key`.
    pub fn channel(mut self, key: ChannelKey) -> Self {
        self.channel = Some(key);
        self
    }

    /// Toggle the initial fetch on open.
    pub fn auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch = enabled;
        self
    }

    /// Parameters of the initial fetch.
    pub fn params(mut self, params: FetchParams) -> Self {
        self.initial_params = params;
        self
    }

    /// Skip pushes of this kind entirely.
    pub fn ignore(mut self, kind: impl Into<String>) -> Self {
        self.ignored_kinds.insert(kind.into());
        self
    }
}

/// A push message classified against this collection.
#[derive(Debug, Clone, PartialEq)]
pub enum PushDelta {
    Created(Value),
    Updated(Value),
    Deleted(ResourceId),
    /// Anything whose shape does not match the collection; answered with a
    /// full refresh.
    Unrecognized(String),
}

impl PushDelta {
    /// Classify by kind suffix (`created`, `updated`, `deleted`). A known
    /// suffix whose payload carries no usable id is unrecognized too.
    pub fn classify(envelope: &Envelope) -> Self {
        let kind = envelope.kind.to_ascii_lowercase();
        let unrecognized = || Self::Unrecognized(envelope.kind.clone());

        if kind.ends_with("created") || kind.ends_with("updated") {
            let item = envelope.item();
            if ResourceId::of(&item).is_none() {
                return unrecognized();
            }
            if kind.ends_with("created") {
                Self::Created(item)
            } else {
                Self::Updated(item)
            }
        } else if kind.ends_with("deleted") {
            envelope
                .resource_id()
                .map_or_else(unrecognized, Self::Deleted)
        } else {
            unrecognized()
        }
    }
}

/// Shallow merge; `id` is never overwritten.
fn merge_fields(target: &mut Value, fields: &Map<String, Value>) {
    if let Value::Object(existing) = target {
        for (key, value) in fields {
            if key != "id" {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
}

struct Listing {
    items: Vec<Value>,
    pagination: Option<Pagination>,
}

/// Accept a bare list, `{data|items: [...], pagination|meta?}`, or one object.
fn normalize(body: Value) -> Listing {
    match body {
        Value::Array(items) => Listing {
            items,
            pagination: None,
        },
        Value::Object(mut map) => {
            for field in ["data", "items"] {
                if matches!(map.get(field), Some(Value::Array(_))) {
                    let items = match map.remove(field) {
                        Some(Value::Array(items)) => items,
                        _ => Vec::new(),
                    };
                    let pagination = map
                        .remove("pagination")
                        .or_else(|| map.remove("meta"))
                        .and_then(|meta| serde_json::from_value(meta).ok());
                    return Listing { items, pagination };
                }
            }
            let single = match map.remove("data") {
                Some(data @ Value::Object(_)) => data,
                Some(other) => {
                    map.insert("data".to_owned(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            };
            Listing {
                items: vec![single],
                pagination: None,
            }
        }
        Value::Null => Listing {
            items: Vec::new(),
            pagination: None,
        },
        other => {
            log::warn!("Ignoring list response of unexpected shape: {other}");
            Listing {
                items: Vec::new(),
                pagination: None,
            }
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    items: Vec<Value>,
    /// Fetches started and not yet settled.
    in_flight: usize,
    error: Option<String>,
    pagination: Option<Pagination>,
    last_params: FetchParams,
    disposed: bool,
}

impl CacheState {
    fn loading(&self) -> bool {
        self.in_flight > 0
    }

    fn position(&self, id: &ResourceId) -> Option<usize> {
        self.items
            .iter()
            .position(|item| ResourceId::of(item).as_ref() == Some(id))
    }

    /// Replace the collection with a server snapshot, first occurrence wins.
    fn replace_all(&mut self, listing: Listing, endpoint: &str) {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(listing.items.len());
        for item in listing.items {
            match ResourceId::of(&item) {
                Some(id) => {
                    if seen.insert(id) {
                        items.push(item);
                    }
                }
                None => log::warn!("Dropping '{endpoint}' record without an id"),
            }
        }
        self.items = items;
        self.pagination = listing.pagination;
    }

    /// Insert at the front, or merge into the existing entry with that id.
    fn upsert_front(&mut self, item: Value) -> bool {
        let Some(id) = ResourceId::of(&item) else {
            return false;
        };
        match (self.position(&id), item) {
            (Some(index), Value::Object(fields)) => {
                merge_fields(&mut self.items[index], &fields);
            }
            (_, item) => self.items.insert(0, item),
        }
        true
    }

    fn merge(&mut self, id: &ResourceId, fields: &Map<String, Value>) -> bool {
        match self.position(id) {
            Some(index) => {
                merge_fields(&mut self.items[index], fields);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &ResourceId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }
}

struct CacheInner {
    config: CacheConfig,
    api: Arc<dyn ResourceApi>,
    registry: Option<ConnectionRegistry>,
    state: Mutex<CacheState>,
    subscription: Mutex<Option<Subscription>>,
    revision: watch::Sender<u64>,
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Cache handle. Clones share one collection.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl ResourceCache {
    /// Build a cache without touching the network.
    pub fn new(
        config: CacheConfig,
        api: Arc<dyn ResourceApi>,
        registry: Option<ConnectionRegistry>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let last_params = config.initial_params.clone();
        Self {
            inner: Arc::new(CacheInner {
                config,
                api,
                registry,
                state: Mutex::new(CacheState {
                    last_params,
                    ..CacheState::default()
                }),
                subscription: Mutex::new(None),
                revision,
            }),
        }
    }

    /// Build a cache, attach it to its channel (if configured and a registry
    /// is given), then run the initial fetch unless auto-fetch is off.
    pub async fn open(
        config: CacheConfig,
        api: Arc<dyn ResourceApi>,
        registry: Option<ConnectionRegistry>,
    ) -> Self {
        let cache = Self::new(config, api, registry);
        let channel = cache.inner.config.channel.clone();
        if let (Some(registry), Some(key)) = (&cache.inner.registry, channel) {
            let session = registry.get_or_create(&key).await;
            cache.attach(&session);
        }
        if cache.inner.config.auto_fetch {
            let params = cache.inner.config.initial_params.clone();
            cache.fetch(params).await;
        }
        cache
    }

    /// Route every envelope of `session` into this cache. Replaces a
    /// previous attachment.
    pub fn attach(&self, session: &ChannelSession) {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let subscription = session.subscribe_all(move |frame: &Value| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match Envelope::from_value(frame.clone()) {
                Ok(envelope) => ResourceCache { inner }.apply_push(&envelope),
                Err(e) => log::debug!("Skipping push frame: {e}"),
            }
        });
        let previous = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    /// Endpoint path this cache loads from.
    pub fn endpoint(&self) -> &str {
        &self.inner.config.endpoint
    }

    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Load the collection. Failures land in the error field and are not
    /// returned. Overlapping fetches keep the cache loading until the last
    /// one settles.
    pub async fn fetch(&self, params: FetchParams) {
        {
            let mut state = self.inner.lock_state();
            if state.disposed {
                return;
            }
            state.in_flight += 1;
            state.last_params = params.clone();
        }
        self.inner.bump();

        let result = self.inner.api.list(self.endpoint(), &params).await;

        {
            let mut state = self.inner.lock_state();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.disposed {
                return;
            }
            match result {
                Ok(body) => {
                    state.replace_all(normalize(body), self.endpoint());
                    state.error = None;
                }
                Err(e) => {
                    log::warn!("Fetching '{}' failed: {e}", self.endpoint());
                    state.error = Some(e.to_string());
                }
            }
        }
        self.inner.bump();
    }

    /// Fetch again with the parameters of the last fetch.
    pub async fn refresh(&self) {
        let params = self.inner.lock_state().last_params.clone();
        self.fetch(params).await;
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.inner.lock_state().disposed {
            return Err(CacheError::Disposed(self.endpoint().to_owned()));
        }
        Ok(())
    }

    fn fail(&self, error: ApiError) -> CacheError {
        log::warn!("Request on '{}' failed: {error}", self.endpoint());
        self.inner.lock_state().error = Some(error.to_string());
        self.inner.bump();
        CacheError::Api(error)
    }

    /// Create on the server, then put the returned item at the front.
    pub async fn create(&self, item: Value) -> Result<Value, CacheError> {
        self.ensure_live()?;
        let created = match self.inner.api.create(self.endpoint(), &item).await {
            Ok(created) => created,
            Err(e) => return Err(self.fail(e)),
        };
        {
            let mut state = self.inner.lock_state();
            state.error = None;
            if !state.disposed && !state.upsert_front(created.clone()) {
                log::warn!("Created '{}' record has no id; not cached", self.endpoint());
            }
        }
        self.inner.bump();
        Ok(created)
    }

    /// Update on the server, then shallow-merge the response into the
    /// cached item. Fields the response omits keep their local values; an
    /// empty or non-object response merges the patch itself. Any object
    /// reply is taken to be the updated record, so an acknowledgement body
    /// such as `{"success": true}` is merged as fields too.
    pub async fn update(&self, id: impl Into<ResourceId>, patch: Value) -> Result<Value, CacheError> {
        self.ensure_live()?;
        let id = id.into();
        let returned = match self.inner.api.update(self.endpoint(), &id, &patch).await {
            Ok(returned) => returned,
            Err(e) => return Err(self.fail(e)),
        };
        let merged = {
            let mut state = self.inner.lock_state();
            state.error = None;
            let fields = match (&returned, &patch) {
                (Value::Object(fields), _) | (_, Value::Object(fields)) => fields.clone(),
                _ => Map::new(),
            };
            if !state.disposed && state.merge(&id, &fields) {
                state.position(&id).map(|index| state.items[index].clone())
            } else {
                None
            }
        };
        self.inner.bump();
        Ok(merged.unwrap_or(returned))
    }

    /// Delete on the server, then drop the item locally.
    pub async fn remove(&self, id: impl Into<ResourceId>) -> Result<(), CacheError> {
        self.ensure_live()?;
        let id = id.into();
        if let Err(e) = self.inner.api.delete(self.endpoint(), &id).await {
            return Err(self.fail(e));
        }
        {
            let mut state = self.inner.lock_state();
            state.error = None;
            state.remove(&id);
        }
        self.inner.bump();
        Ok(())
    }

    /// Reconcile one push message. Unrecognized kinds schedule a refresh on
    /// the current runtime.
    pub fn apply_push(&self, envelope: &Envelope) {
        if self.inner.config.ignored_kinds.contains(&envelope.kind) {
            return;
        }
        let delta = PushDelta::classify(envelope);
        let changed = {
            let mut state = self.inner.lock_state();
            if state.disposed {
                return;
            }
            match &delta {
                PushDelta::Created(item) => state.upsert_front(item.clone()),
                PushDelta::Updated(item) => match (ResourceId::of(item), item) {
                    (Some(id), Value::Object(fields)) => state.merge(&id, fields),
                    _ => false,
                },
                PushDelta::Deleted(id) => state.remove(id),
                PushDelta::Unrecognized(_) => false,
            }
        };
        if changed {
            self.inner.bump();
        }

        if let PushDelta::Unrecognized(kind) = delta {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    log::debug!("Refreshing '{}' after '{kind}'", self.endpoint());
                    let cache = self.clone();
                    handle.spawn(async move { cache.refresh().await });
                }
                Err(_) => log::warn!("No runtime to refresh '{}' after '{kind}'", self.endpoint()),
            }
        }
    }

    /// Everything a view renders, read under one lock.
    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.inner.lock_state();
        CacheSnapshot {
            items: state.items.clone(),
            loading: state.loading(),
            error: state.error.clone(),
            pagination: state.pagination.clone(),
        }
    }

    /// Current collection, in display order.
    pub fn items(&self) -> Vec<Value> {
        self.inner.lock_state().items.clone()
    }

    /// The collection as typed records.
    pub fn items_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        self.items().into_iter().map(serde_json::from_value).collect()
    }

    /// The cached record with this id.
    pub fn get(&self, id: &ResourceId) -> Option<Value> {
        let state = self.inner.lock_state();
        state.position(id).map(|index| state.items[index].clone())
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.inner.lock_state().items.len()
    }

    /// Whether the collection holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.lock_state().items.is_empty()
    }

    /// Whether any fetch is still in flight.
    pub fn loading(&self) -> bool {
        self.inner.lock_state().loading()
    }

    /// Last request failure, cleared by the next success.
    pub fn error(&self) -> Option<String> {
        self.inner.lock_state().error.clone()
    }

    /// Pagination of the last enveloped list response.
    pub fn pagination(&self) -> Option<Pagination> {
        self.inner.lock_state().pagination.clone()
    }

    /// Revision counter, bumped on every observable change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Whether [`ResourceCache::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock_state().disposed
    }

    /// Stop listening, drop the collection, and release the channel.
    /// Requests already in flight are not aborted; their results are
    /// discarded.
    pub async fn dispose(&self) {
        let subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        {
            let mut state = self.inner.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.items.clear();
            state.in_flight = 0;
        }
        self.inner.bump();
        if let (Some(registry), Some(key)) = (&self.inner.registry, &self.inner.config.channel) {
            registry.release(key).await;
        }
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("endpoint", &self.inner.config.endpoint)
            .field("channel", &self.inner.config.channel)
            .field("len", &self.len())
            .finish()
    }
}
