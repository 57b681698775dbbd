//! Sync store
//!
//! The `SyncStore` is the single entry point the application talks to. It
//! coordinates between:
//! - the local cache (offline-first, durable across restarts)
//! - an optional remote mirror (a real-time document database)
//! - subscribers, which receive the whole collection on every change
//!
//! ## Write path
//!
//! `save` and `remove` update the local cache and notify subscribers right
//! away, before the caller ever awaits. The returned future then forwards the
//! same change to the remote. Remote failures are logged and never retried;
//! the next remote snapshot settles any divergence.
//!
//! ## Read path
//!
//! Every subscribed collection gets one shared remote listener. Each remote
//! snapshot overwrites the local copy of that collection (last writer wins)
//! and is delivered to every subscriber.
//!
//! ## Usage
//!
//! ```ignore
//! let store = SyncStore::open(&config).await;
//!
//! let subscription = store.subscribe("orders", |orders| {
//!     println!("{} orders", orders.len());
//! });
//!
//! store.save("orders", "o1", patch).await;
//! subscription.cancel();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{Collection, Fields, Record, ID_FIELD};
use crate::remote::{ListenerRelease, RemoteStore, WsRemote, WsRemoteConfig};
use crate::storage::{FilePersistence, LocalCache, StorageStats};

type Callback = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Offline-first collection store with optional remote mirroring
///
/// Cheap to clone; clones share the same cache, remote and subscribers.
#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Mutex<CacheState>,
    remote: Option<Arc<dyn RemoteStore>>,
    registry: Mutex<Registry>,
    next_subscription: AtomicU64,
}

struct CacheState {
    local: LocalCache,
    /// Bumped on every change, orders deliveries
    version: u64,
}

#[derive(Default)]
struct Registry {
    feeds: HashMap<String, Feed>,
}

/// Subscribers of one collection and their shared remote listener
#[derive(Default)]
struct Feed {
    slots: Vec<Arc<Slot>>,
    listener: Option<JoinHandle<()>>,
    /// Detaches the remote listener; owned here so cancel can drop it inline
    release: Option<ListenerRelease>,
    /// Identifies the listener task allowed to hand over its release
    generation: u64,
}

/// A collection state ready for delivery
#[derive(Clone)]
struct Change {
    version: u64,
    records: Arc<Collection>,
}

impl SyncStore {
    /// Create a store that only uses the local cache
    pub fn local(cache: LocalCache) -> Self {
        Self::build(cache, None)
    }

    /// Create a store that mirrors every collection to `remote`
    pub fn mirrored(cache: LocalCache, remote: Arc<dyn RemoteStore>) -> Self {
        Self::build(cache, Some(remote))
    }

    /// Create a local-only store that keeps nothing beyond the process
    pub fn in_memory() -> Self {
        Self::local(LocalCache::in_memory())
    }

    /// Open the store described by `config`
    ///
    /// The cache lives under the configured data directory. When a remote is
    /// enabled and configured, a WebSocket mirror is connected; if that
    /// fails the store runs local-only for this session.
    pub async fn open(config: &Config) -> Self {
        let persistence = Arc::new(FilePersistence::new(config.cache_dir()));
        let cache = LocalCache::new(persistence, config.cache_prefix.clone());

        let Some(url) = config.active_remote_url() else {
            debug!("Remote mirroring disabled");
            return Self::local(cache);
        };

        match WsRemote::connect(WsRemoteConfig::new(url)).await {
            Ok(remote) => Self::mirrored(cache, Arc::new(remote)),
            Err(e) => {
                warn!(url, error = %e, "Remote unavailable; running local-only");
                Self::local(cache)
            }
        }
    }

    fn build(cache: LocalCache, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(CacheState {
                    local: cache,
                    version: 0,
                }),
                remote,
                registry: Mutex::new(Registry::default()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Whether writes and subscriptions are mirrored to a remote
    pub fn is_mirrored(&self) -> bool {
        self.inner.remote.is_some()
    }

    /// Watch a collection
    ///
    /// `callback` is invoked once with the current local contents before
    /// this returns, then again with the whole collection after every local
    /// or remote change, until the returned handle is cancelled or dropped.
    ///
    /// Invocations for one subscription never overlap. A change made from
    /// inside the callback is delivered after the callback returns.
    pub fn subscribe<F>(&self, collection: &str, callback: F) -> Subscription
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        if collection.is_empty() {
            warn!("Subscribe called without a collection name");
            callback(&[]);
            return Subscription::inert();
        }

        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, collection, Arc::new(callback)));

        // Changes racing the registration queue behind the first delivery
        slot.claim();
        self.inner.register(&slot);
        slot.drain(self.inner.current(collection));

        Subscription {
            store: Arc::downgrade(&self.inner),
            slot: Some(slot),
        }
    }

    /// Merge `patch` into record `id` of `collection`
    ///
    /// Fields present in the patch overwrite, absent fields are kept, and a
    /// missing record is appended. An `id` key inside the patch is ignored.
    /// An empty `collection` or `id` makes this a no-op.
    ///
    /// The local cache and subscribers are updated when `save` is called;
    /// the returned future performs the remote write and logs its failure.
    pub fn save(
        &self,
        collection: &str,
        id: &str,
        mut patch: Fields,
    ) -> impl Future<Output = ()> + Send + 'static {
        let remote = if collection.is_empty() || id.is_empty() {
            debug!(collection, id, "Save ignored: empty collection or id");
            None
        } else {
            patch.remove(ID_FIELD);
            let change = self
                .inner
                .apply(|cache| Some(cache.upsert_merge(collection, id, &patch)));
            if let Some(change) = change {
                self.inner.notify(collection, change);
            }
            self.inner.remote.clone()
        };

        let (collection, id) = (collection.to_string(), id.to_string());
        async move {
            let Some(remote) = remote else { return };
            if let Err(e) = remote.merge(&collection, &id, &patch).await {
                warn!(
                    collection = %collection,
                    id = %id,
                    error = %e,
                    "Remote save failed; local cache keeps the change"
                );
            }
        }
    }

    /// Delete record `id` from `collection`
    ///
    /// Subscribers are only notified if the record existed locally. The
    /// returned future issues the remote delete either way.
    pub fn remove(&self, collection: &str, id: &str) -> impl Future<Output = ()> + Send + 'static {
        let remote = if collection.is_empty() || id.is_empty() {
            debug!(collection, id, "Remove ignored: empty collection or id");
            None
        } else {
            if let Some(change) = self.inner.apply(|cache| cache.remove(collection, id)) {
                self.inner.notify(collection, change);
            }
            self.inner.remote.clone()
        };

        let (collection, id) = (collection.to_string(), id.to_string());
        async move {
            let Some(remote) = remote else { return };
            if let Err(e) = remote.delete(&collection, &id).await {
                warn!(
                    collection = %collection,
                    id = %id,
                    error = %e,
                    "Remote delete failed"
                );
            }
        }
    }

    /// Read a collection once
    ///
    /// Prefers a fresh remote read. An empty or failed remote read falls
    /// back to the local cache, and an empty cache falls back to `default`.
    /// The cache is left untouched.
    pub async fn get_all(&self, collection: &str, default: Collection) -> Collection {
        if collection.is_empty() {
            return default;
        }

        if let Some(remote) = &self.inner.remote {
            match remote.fetch_all(collection).await {
                Ok(records) if !records.is_empty() => return records,
                Ok(_) => debug!(collection, "Remote collection empty; reading local cache"),
                Err(e) => warn!(collection, error = %e, "Remote read failed; reading local cache"),
            }
        }

        let local = self.cached(collection);
        if local.is_empty() {
            default
        } else {
            local
        }
    }

    /// Local contents of a collection
    pub fn cached(&self, collection: &str) -> Collection {
        self.inner.cache().local.get_all(collection)
    }

    /// A single record from the local cache
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        self.inner.cache().local.get(collection, id)
    }

    /// Names of every locally cached collection
    pub fn collection_names(&self) -> Vec<String> {
        self.inner.cache().local.collection_names()
    }

    /// Local storage statistics
    pub fn storage_stats(&self) -> StorageStats {
        self.inner.cache().local.stats()
    }

    /// Number of active subscriptions on a collection
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.inner
            .registry()
            .feeds
            .get(collection)
            .map_or(0, |feed| feed.slots.len())
    }
}

impl Inner {
    fn cache(&self) -> MutexGuard<'_, CacheState> {
        lock(&self.cache)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn current(&self, collection: &str) -> Change {
        let mut cache = self.cache();
        let records = cache.local.get_all(collection);
        Change {
            version: cache.version,
            records: Arc::new(records),
        }
    }

    /// Run a cache mutation; `None` from `mutate` means nothing changed
    fn apply(&self, mutate: impl FnOnce(&mut LocalCache) -> Option<Collection>) -> Option<Change> {
        let mut cache = self.cache();
        let records = mutate(&mut cache.local)?;
        cache.version += 1;
        Some(Change {
            version: cache.version,
            records: Arc::new(records),
        })
    }

    fn apply_snapshot(&self, collection: &str, records: Collection) {
        debug!(collection, records = records.len(), "Applying remote snapshot");
        if let Some(change) = self.apply(|cache| Some(cache.replace(collection, records))) {
            self.notify(collection, change);
        }
    }

    fn notify(&self, collection: &str, change: Change) {
        let slots = match self.registry().feeds.get(collection) {
            Some(feed) => feed.slots.clone(),
            None => return,
        };
        for slot in slots {
            slot.deliver(change.clone());
        }
    }

    fn register(self: &Arc<Self>, slot: &Arc<Slot>) {
        let mut registry = self.registry();
        let feed = registry.feeds.entry(slot.collection.clone()).or_default();
        feed.slots.push(slot.clone());

        let listening = feed
            .listener
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !listening {
            feed.release = None;
            feed.generation = slot.id;
            feed.listener = self.spawn_listener(&slot.collection, slot.id);
        }
    }

    fn unregister(&self, slot: &Slot) {
        let feed = {
            let mut registry = self.registry();
            let Some(feed) = registry.feeds.get_mut(&slot.collection) else {
                return;
            };
            feed.slots.retain(|other| other.id != slot.id);
            if !feed.slots.is_empty() {
                return;
            }
            registry.feeds.remove(&slot.collection)
        };

        let Some(feed) = feed else { return };
        if let Some(handle) = feed.listener {
            debug!(collection = %slot.collection, "Last subscriber gone; stopping remote listener");
            handle.abort();
        }
        drop(feed.release);
    }

    /// Take ownership of a freshly started listener's release hook
    ///
    /// Returns false when the feed that started the listener is gone.
    fn adopt_listener(
        &self,
        collection: &str,
        generation: u64,
        release: Option<ListenerRelease>,
    ) -> bool {
        let mut registry = self.registry();
        match registry.feeds.get_mut(collection) {
            Some(feed) if feed.generation == generation => {
                feed.release = release;
                true
            }
            _ => false,
        }
    }

    fn spawn_listener(
        self: &Arc<Self>,
        collection: &str,
        generation: u64,
    ) -> Option<JoinHandle<()>> {
        let remote = self.remote.clone()?;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(listen_remote(
                Arc::downgrade(self),
                remote,
                collection.to_string(),
                generation,
            ))),
            Err(_) => {
                debug!(collection, "No async runtime; subscription stays local-only");
                None
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for feed in self.registry().feeds.values() {
            if let Some(handle) = &feed.listener {
                handle.abort();
            }
        }
    }
}

/// Shared remote listener task of one collection
async fn listen_remote(
    store: Weak<Inner>,
    remote: Arc<dyn RemoteStore>,
    collection: String,
    generation: u64,
) {
    let mut stream = match remote.listen(&collection).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(collection = %collection, error = %e, "Remote listener unavailable; staying local-only");
            return;
        }
    };

    let adopted = store
        .upgrade()
        .is_some_and(|owner| owner.adopt_listener(&collection, generation, stream.take_release()));
    if !adopted {
        debug!(collection = %collection, "Subscribers left before the remote listener started");
        return;
    }
    info!(collection = %collection, "Listening for remote changes");

    while let Some(event) = stream.next().await {
        let Some(store) = store.upgrade() else {
            break;
        };
        match event {
            Ok(records) => store.apply_snapshot(&collection, records),
            Err(e) => warn!(collection = %collection, error = %e, "Remote listener error"),
        }
    }

    debug!(collection = %collection, "Remote listener ended");
}

/// One registered callback
struct Slot {
    id: u64,
    collection: String,
    callback: Callback,
    active: AtomicBool,
    /// Held for the whole time a thread is delivering
    gate: Mutex<()>,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    running: bool,
    owner: Option<ThreadId>,
    /// Newest change that arrived while a delivery was running
    pending: Option<Change>,
    /// Oldest version still worth delivering
    min_next: u64,
}

impl Slot {
    fn new(id: u64, collection: &str, callback: Callback) -> Self {
        Self {
            id,
            collection: collection.to_string(),
            callback,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            state: Mutex::new(SlotState::default()),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deliver(&self, change: Change) {
        if !self.is_active() {
            return;
        }

        {
            let mut state = lock(&self.state);
            if state.running {
                let newer = state
                    .pending
                    .as_ref()
                    .map_or(true, |pending| pending.version <= change.version);
                if newer {
                    state.pending = Some(change);
                }
                return;
            }
            state.running = true;
            state.owner = Some(thread::current().id());
        }

        self.drain(change);
    }

    /// Mark this thread as the one delivering before any change can arrive
    fn claim(&self) {
        let mut state = lock(&self.state);
        state.running = true;
        state.owner = Some(thread::current().id());
    }

    /// Deliver `change` and everything queued behind it; the caller holds the claim
    fn drain(&self, change: Change) {
        let mut run = Running {
            state: &self.state,
            done: false,
        };
        let _gate = lock(&self.gate);

        let mut next = change;
        loop {
            if self.is_active() && self.advance(next.version) {
                (self.callback)(&next.records);
            }

            let mut state = lock(&self.state);
            match state.pending.take() {
                Some(change) => next = change,
                None => {
                    state.running = false;
                    state.owner = None;
                    run.done = true;
                    break;
                }
            }
        }
    }

    /// Claim `version` for delivery unless something newer already went out
    fn advance(&self, version: u64) -> bool {
        let mut state = lock(&self.state);
        if version < state.min_next {
            return false;
        }
        state.min_next = version + 1;
        true
    }

    /// Stop deliveries; returns once no callback is running elsewhere
    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);

        let delivering_here = lock(&self.state).owner == Some(thread::current().id());
        if !delivering_here {
            drop(lock(&self.gate));
        }
    }
}

/// Releases a slot if its callback panics mid-delivery
struct Running<'a> {
    state: &'a Mutex<SlotState>,
    done: bool,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut state = lock(self.state);
            state.running = false;
            state.owner = None;
            state.pending = None;
        }
    }
}

/// Handle to an active subscription
///
/// Dropping the handle cancels the subscription. Use [`detach`](Self::detach)
/// to keep it for the lifetime of the store instead.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    store: Weak<Inner>,
    slot: Option<Arc<Slot>>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            store: Weak::new(),
            slot: None,
        }
    }

    /// The watched collection
    pub fn collection(&self) -> &str {
        self.slot.as_ref().map_or("", |slot| slot.collection.as_str())
    }

    /// Whether the callback can still be invoked
    pub fn is_active(&self) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.is_active())
    }

    /// Stop the subscription
    ///
    /// Once this returns the callback is never invoked again. Cancelling
    /// from inside the callback itself is allowed.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Keep the subscription alive without holding the handle
    pub fn detach(mut self) {
        self.slot = None;
    }

    fn release(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        slot.deactivate();
        if let Some(store) = self.store.upgrade() {
            store.unregister(&slot);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
