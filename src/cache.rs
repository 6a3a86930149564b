//! In-memory cache of query results.
//!
//! Entries are keyed by endpoint name plus serialized arguments. An entry is
//! created by its first subscriber, fetched once, and shared by every later
//! subscriber. When the last subscriber leaves, the entry is torn down after a
//! grace delay; cleanup callbacks registered at creation (socket listeners)
//! run before the entry is dropped.
//!
//! Each entry keeps the server-confirmed data separately from optimistic
//! layers. Visible data is the confirmed data with the layers applied in
//! issue order, so removing one layer never disturbs the others or anything
//! written underneath them.
//!
//! Cache state sits behind one mutex and every mutation is applied inside a
//! single critical section, so subscribers never observe a partial update.
//! Fetches run as tokio tasks; `subscribe` must be called within a runtime.

use crate::error::{SyncError, SyncResult};
use crate::model::{CommentList, ConversationPage, Lead, LeadPage, MessageThread};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Endpoint name plus serialized arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    endpoint: &'static str,
    args: String,
}

impl QueryKey {
    /// Arguments that fail to serialize get a key of their own, tagged with
    /// the error, rather than sharing the empty key.
    pub fn new<A: Serialize + ?Sized>(endpoint: &'static str, args: &A) -> Self {
        let args = match serde_json::to_string(args) {
            Ok(args) => args,
            Err(e) => {
                warn!("Could not serialize arguments for {}: {}", endpoint, e);
                format!("!{e}")
            }
        };
        Self { endpoint, args }
    }

    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    pub fn args(&self) -> &str {
        &self.args
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.endpoint, self.args)
    }
}

/// Invalidation tags provided by entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    Leads,
    Lead(String),
    Comment(String),
}

/// Cached payload of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheData {
    Conversations(ConversationPage),
    Messages(MessageThread),
    Lead(Lead),
    Leads(LeadPage),
    Comments(CommentList),
    Json(Value),
}

impl CacheData {
    pub fn as_conversations(&self) -> Option<&ConversationPage> {
        match self {
            CacheData::Conversations(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_messages(&self) -> Option<&MessageThread> {
        match self {
            CacheData::Messages(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn as_lead(&self) -> Option<&Lead> {
        match self {
            CacheData::Lead(lead) => Some(lead),
            _ => None,
        }
    }

    pub fn as_leads(&self) -> Option<&LeadPage> {
        match self {
            CacheData::Leads(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_comments(&self) -> Option<&CommentList> {
        match self {
            CacheData::Comments(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CacheData::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A replayable transformation of cached data.
pub type Mutator = Arc<dyn Fn(&mut CacheData) + Send + Sync>;

/// Produces the data for an entry; called on creation and on every refetch.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<CacheData>> + Send + Sync>;

/// Runs when an entry is torn down.
pub type Cleanup = Box<dyn FnOnce() + Send>;

pub fn mutator(f: impl Fn(&mut CacheData) + Send + Sync + 'static) -> Mutator {
    Arc::new(f)
}

/// What a subscriber sees after each change.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: u64,
    pub data: Option<Arc<CacheData>>,
    pub error: Option<SyncError>,
    pub fetching: bool,
}

struct Layer {
    id: u64,
    patch: Mutator,
}

struct Entry {
    confirmed: Option<CacheData>,
    layers: Vec<Layer>,
    visible: Option<Arc<CacheData>>,
    error: Option<SyncError>,
    revision: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Snapshot>>,
    tags: Vec<Tag>,
    fetcher: Fetcher,
    fetch_id: Option<u64>,
    // Merges applied while a fetch is in flight, replayed on its result.
    replay: Vec<Mutator>,
    stale: bool,
    teardown_epoch: u64,
    cleanups: Vec<Cleanup>,
}

impl Entry {
    fn new(fetcher: Fetcher, tags: Vec<Tag>) -> Self {
        Self {
            confirmed: None,
            layers: Vec::new(),
            visible: None,
            error: None,
            revision: 0,
            subscribers: HashMap::new(),
            tags,
            fetcher,
            fetch_id: None,
            replay: Vec::new(),
            stale: false,
            teardown_epoch: 0,
            cleanups: Vec::new(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            data: self.visible.clone(),
            error: self.error.clone(),
            fetching: self.fetch_id.is_some(),
        }
    }

    fn recompute(&mut self) {
        self.visible = self.confirmed.as_ref().map(|confirmed| {
            let mut data = confirmed.clone();
            for layer in &self.layers {
                (layer.patch)(&mut data);
            }
            Arc::new(data)
        });
    }

    fn notify(&mut self) {
        self.revision += 1;
        let snapshot = self.snapshot();
        for tx in self.subscribers.values() {
            let _ = tx.send(snapshot.clone());
        }
    }

    /// Apply a merge to confirmed data. Returns false if the initial fetch
    /// hasn't landed yet and the merge was only recorded.
    fn merge(&mut self, m: &Mutator) -> bool {
        if self.fetch_id.is_some() {
            self.replay.push(m.clone());
        }
        match self.confirmed.as_mut() {
            Some(data) => {
                m(data);
                self.recompute();
                true
            }
            None => false,
        }
    }
}

struct State {
    entries: HashMap<QueryKey, Entry>,
}

struct Inner {
    state: Mutex<State>,
    grace: Duration,
    next_id: AtomicU64,
}

/// Shared handle to the cache.
#[derive(Clone)]
pub struct EntityCache {
    inner: Arc<Inner>,
}

struct FetchJob {
    key: QueryKey,
    fetch_id: u64,
    fetcher: Fetcher,
}

impl EntityCache {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                }),
                grace,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Visible data for `key`, if any.
    pub fn get(&self, key: &QueryKey) -> Option<Arc<CacheData>> {
        let state = self.inner.state.lock();
        state.entries.get(key).and_then(|e| e.visible.clone())
    }

    pub fn snapshot(&self, key: &QueryKey) -> Option<Snapshot> {
        let state = self.inner.state.lock();
        state.entries.get(key).map(Entry::snapshot)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        let state = self.inner.state.lock();
        state.entries.get(key).map_or(0, |e| e.subscribers.len())
    }

    /// Keys of every live entry for `endpoint`.
    pub fn keys_for(&self, endpoint: &str) -> Vec<QueryKey> {
        let state = self.inner.state.lock();
        let mut keys: Vec<QueryKey> = state
            .entries
            .keys()
            .filter(|k| k.endpoint == endpoint)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn subscribe(&self, key: QueryKey, tags: Vec<Tag>, fetcher: Fetcher) -> Subscription {
        self.subscribe_with(key, tags, fetcher, || None)
    }

    /// Subscribe to `key`. If the entry doesn't exist yet it is created, a
    /// fetch starts, and `attach` runs once; the cleanup it returns is invoked
    /// when the entry is torn down.
    pub fn subscribe_with<A>(
        &self,
        key: QueryKey,
        tags: Vec<Tag>,
        fetcher: Fetcher,
        attach: A,
    ) -> Subscription
    where
        A: FnOnce() -> Option<Cleanup>,
    {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let (created, job) = {
            let mut state = self.inner.state.lock();
            match state.entries.get_mut(&key) {
                Some(entry) => {
                    // Cancels any pending teardown.
                    entry.teardown_epoch += 1;
                    if entry.visible.is_some() {
                        let _ = tx.send(entry.snapshot());
                    }
                    entry.subscribers.insert(id, tx);
                    let retry = entry.confirmed.is_none() && entry.error.is_some();
                    let job = if (entry.stale || retry) && entry.fetch_id.is_none() {
                        debug!("Refetching entry {}", key);
                        Some(self.begin_fetch(&key, entry))
                    } else {
                        None
                    };
                    (false, job)
                }
                None => {
                    debug!("Creating cache entry {}", key);
                    let mut entry = Entry::new(fetcher, tags);
                    entry.subscribers.insert(id, tx);
                    let job = self.begin_fetch(&key, &mut entry);
                    state.entries.insert(key.clone(), entry);
                    (true, Some(job))
                }
            }
        };

        if created {
            if let Some(cleanup) = attach() {
                let mut state = self.inner.state.lock();
                match state.entries.get_mut(&key) {
                    Some(entry) => entry.cleanups.push(cleanup),
                    None => {
                        drop(state);
                        cleanup();
                    }
                }
            }
        }

        if let Some(job) = job {
            self.spawn_fetch(job);
        }

        Subscription {
            key,
            id,
            rx,
            cache: self.clone(),
            active: true,
        }
    }

    fn begin_fetch(&self, key: &QueryKey, entry: &mut Entry) -> FetchJob {
        let fetch_id = self.next_id();
        entry.fetch_id = Some(fetch_id);
        entry.replay.clear();
        FetchJob {
            key: key.clone(),
            fetch_id,
            fetcher: entry.fetcher.clone(),
        }
    }

    fn spawn_fetch(&self, job: FetchJob) {
        let cache = self.clone();
        let fut = (job.fetcher)();
        tokio::spawn(async move {
            let result = fut.await;
            cache.resolve(&job.key, job.fetch_id, result);
        });
    }

    /// Apply a fetch result. Results for entries that were torn down or for
    /// fetches superseded by a newer one are discarded.
    fn resolve(&self, key: &QueryKey, fetch_id: u64, result: SyncResult<CacheData>) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            debug!("Discarding fetch result for torn-down entry {}", key);
            return;
        };
        if entry.fetch_id != Some(fetch_id) {
            debug!("Discarding superseded fetch result for {}", key);
            return;
        }
        entry.fetch_id = None;
        let replay = std::mem::take(&mut entry.replay);

        match result {
            Ok(mut data) => {
                if !replay.is_empty() {
                    trace!("Replaying {} merges onto fetched {}", replay.len(), key);
                }
                for m in &replay {
                    m(&mut data);
                }
                entry.confirmed = Some(data);
                entry.error = None;
                entry.stale = false;
                entry.recompute();
            }
            Err(e) => {
                warn!("Fetch for {} failed: {}", key, e);
                entry.error = Some(e);
            }
        }
        entry.notify();
    }

    /// Apply `m` to the entry's data and notify its subscribers.
    ///
    /// Updating a key with no entry is a no-op that returns false and logs a
    /// warning; it usually means an event arrived for a query nobody holds.
    pub fn update(&self, key: &QueryKey, m: Mutator) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            warn!("Update for missing cache entry {} ignored", key);
            return false;
        };
        if entry.merge(&m) {
            entry.notify();
        }
        true
    }

    /// Apply several updates atomically. Missing keys are skipped; each
    /// touched entry notifies its subscribers once. Returns the number of
    /// entries found.
    pub fn update_many(&self, updates: Vec<(QueryKey, Mutator)>) -> usize {
        let mut state = self.inner.state.lock();
        let mut touched: Vec<QueryKey> = Vec::new();
        let mut found = 0;

        for (key, m) in updates {
            let Some(entry) = state.entries.get_mut(&key) else {
                debug!("Skipping missing cache entry {}", key);
                continue;
            };
            found += 1;
            if entry.merge(&m) && !touched.contains(&key) {
                touched.push(key);
            }
        }

        for key in &touched {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.notify();
            }
        }
        found
    }

    /// Push an optimistic layer. Returns false when there is nothing to patch.
    pub fn push_layer(&self, key: &QueryKey, id: u64, patch: Mutator) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        if entry.confirmed.is_none() {
            return false;
        }
        entry.layers.push(Layer { id, patch });
        entry.recompute();
        entry.notify();
        true
    }

    /// Fold a layer into confirmed data.
    pub fn commit_layer(&self, key: &QueryKey, id: u64) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        let Some(pos) = entry.layers.iter().position(|l| l.id == id) else {
            return false;
        };
        let layer = entry.layers.remove(pos);
        let before = entry.visible.clone();
        entry.merge(&layer.patch);
        if entry.visible != before {
            entry.notify();
        }
        true
    }

    /// Drop a layer; visible data is recomputed from confirmed data and the
    /// remaining layers.
    pub fn remove_layer(&self, key: &QueryKey, id: u64) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        let Some(pos) = entry.layers.iter().position(|l| l.id == id) else {
            return false;
        };
        entry.layers.remove(pos);
        let before = entry.visible.clone();
        entry.recompute();
        if entry.visible != before {
            entry.notify();
        }
        true
    }

    pub fn pending_layers(&self, key: &QueryKey) -> usize {
        let state = self.inner.state.lock();
        state.entries.get(key).map_or(0, |e| e.layers.len())
    }

    /// Mark entries providing any of `tags` stale. Entries with subscribers
    /// refetch now, the rest on their next subscription. Returns the number
    /// of refetches started.
    pub fn invalidate_tags(&self, tags: &[Tag]) -> usize {
        let mut jobs = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for (key, entry) in state.entries.iter_mut() {
                if !entry.tags.iter().any(|t| tags.contains(t)) {
                    continue;
                }
                entry.stale = true;
                if !entry.subscribers.is_empty() {
                    debug!("Invalidated {}, refetching", key);
                    jobs.push(self.begin_fetch(key, entry));
                } else {
                    debug!("Invalidated {}", key);
                }
            }
        }
        let count = jobs.len();
        for job in jobs {
            self.spawn_fetch(job);
        }
        count
    }

    fn unsubscribe(&self, key: &QueryKey, id: u64) {
        let epoch = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            entry.subscribers.remove(&id);
            if !entry.subscribers.is_empty() {
                return;
            }
            entry.teardown_epoch += 1;
            entry.teardown_epoch
        };

        let grace = self.inner.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !grace.is_zero() => {
                let cache = self.clone();
                let key = key.clone();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    cache.teardown(&key, epoch);
                });
            }
            _ => self.teardown(key, epoch),
        }
    }

    fn teardown(&self, key: &QueryKey, epoch: u64) {
        let entry = {
            let mut state = self.inner.state.lock();
            match state.entries.get(key) {
                Some(e) if e.subscribers.is_empty() && e.teardown_epoch == epoch => {
                    state.entries.remove(key)
                }
                _ => None,
            }
        };
        if let Some(mut entry) = entry {
            debug!("Tearing down cache entry {}", key);
            for cleanup in entry.cleanups.drain(..) {
                cleanup();
            }
        }
    }

    /// Drop every entry, running their cleanups.
    pub fn clear(&self) {
        let entries: Vec<(QueryKey, Entry)> = {
            let mut state = self.inner.state.lock();
            state.entries.drain().collect()
        };
        for (key, mut entry) in entries {
            debug!("Clearing cache entry {}", key);
            for cleanup in entry.cleanups.drain(..) {
                cleanup();
            }
        }
    }
}

/// A live interest in one cache entry. Dropping it unsubscribes.
pub struct Subscription {
    key: QueryKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    cache: EntityCache,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&self) -> Option<Arc<CacheData>> {
        self.cache.get(&self.key)
    }

    /// Wait for the next change.
    pub async fn changed(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// The next queued change, if one is already waiting.
    pub fn try_changed(&mut self) -> Option<Snapshot> {
        self.rx.try_recv().ok()
    }

    /// Wait until the entry holds data, or its fetch failed.
    pub async fn loaded(&mut self) -> SyncResult<Arc<CacheData>> {
        if let Some(snapshot) = self.cache.snapshot(&self.key) {
            if let Some(data) = snapshot.data {
                return Ok(data);
            }
            if let (Some(err), false) = (snapshot.error, snapshot.fetching) {
                return Err(err);
            }
        }
        while let Some(snapshot) = self.rx.recv().await {
            if let Some(data) = snapshot.data {
                return Ok(data);
            }
            if let Some(err) = snapshot.error {
                return Err(err);
            }
        }
        Err(SyncError::Network(format!("cache entry {} was dropped", self.key)))
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.cache.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
