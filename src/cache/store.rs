//! Keyed cache store with staleness, subscriptions, and gc bookkeeping.
//!
//! The store owns every [`CacheEntry`] behind a synchronous mutex that is
//! never held across an await point. Mutations publish fresh snapshots to
//! per-entry watch channels and emit [`StoreEvent`]s consumed by the
//! revalidation scheduler, which owns all timers. The store itself never
//! spawns tasks and never touches the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::entry::{CacheEntry, FetchResult, QueryFetcher, QueryOptions, QuerySnapshot, QueryStatus};
use super::error::QueryError;
use super::key::QueryKey;

// ===== Events =====

/// Emitted by the store on transitions the scheduler reacts to.
#[derive(Debug, Clone)]
pub(crate) enum StoreEvent {
    /// A subscriber attached. `first` marks the 0 -> 1 transition.
    Subscribed {
        key: QueryKey,
        first: bool,
        stale: bool,
        refetch_interval: Option<std::time::Duration>,
    },
    /// The entry has zero subscribers; evict at `gc_at` unless resubscribed.
    Idle { key: QueryKey, gc_at: Instant },
    /// The entry was invalidated while subscribed and wants a refetch.
    Invalidated { key: QueryKey },
    /// The whole store was dropped (logout).
    Cleared,
}

/// Outcome of [`QueryStore::prepare_fetch`].
pub(crate) enum PrepareOutcome {
    /// Entry is fresh; serve the snapshot, no fetch.
    Fresh(QuerySnapshot),
    /// Entry is missing data or stale; a fetch episode is warranted.
    Fetch { snapshot: QuerySnapshot, generation: u64 },
}

// ===== Store =====

struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    /// Store-global generation source; regenerated entries never repeat a
    /// generation, so completions from a previous session cannot land.
    next_generation: u64,
}

pub struct QueryStore {
    inner: Mutex<StoreInner>,
    events: mpsc::UnboundedSender<StoreEvent>,
}

impl QueryStore {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StoreEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(QueryStore {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                next_generation: 1,
            }),
            events,
        });
        (store, events_rx)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StoreEvent) {
        if self.events.send(event).is_err() {
            trace!("store event channel closed");
        }
    }

    // ===== Reads =====

    /// Snapshot for a key, or `None` when nothing is cached under it.
    pub fn get(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        self.lock().entries.get(key).map(|e| e.snapshot())
    }

    /// Stale when absent, never fetched, invalidated, or past `stale_time`.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .map(|e| e.is_stale(now))
            .unwrap_or(true)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn current_generation(&self, key: &QueryKey) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.generation)
    }

    /// Registered fetcher and options for a background refetch.
    pub(crate) fn refetch_context(&self, key: &QueryKey) -> Option<(QueryFetcher, QueryOptions)> {
        let inner = self.lock();
        let entry = inner.entries.get(key)?;
        let fetcher = entry.fetcher.clone()?;
        Some((fetcher, entry.options.clone()))
    }

    // ===== Writes =====

    /// Stores fetched data under `key`: status success, error cleared,
    /// timestamps refreshed. Creates the entry when absent.
    pub(crate) fn put(&self, key: &QueryKey, value: serde_json::Value) {
        let now = Instant::now();
        let mut inner = self.lock();
        let (entry, created) = inner.upsert_entry(key, QueryOptions::default());
        entry.record_success(value, now);
        let gc_at = now + entry.options.gc_time;
        let unsubscribed = entry.subscriber_count == 0;
        drop(inner);
        debug!(key = %key, "cache updated");
        if created && unsubscribed {
            self.emit(StoreEvent::Idle { key: key.clone(), gc_at });
        }
    }

    /// Records a fetch failure: status error, previous data retained so
    /// consumers keep rendering stale content alongside the error.
    pub(crate) fn put_error(&self, key: &QueryKey, error: QueryError) {
        let now = Instant::now();
        let mut inner = self.lock();
        let (entry, created) = inner.upsert_entry(key, QueryOptions::default());
        entry.record_error(error);
        let gc_at = now + entry.options.gc_time;
        let unsubscribed = entry.subscriber_count == 0;
        let stale_data = entry.data.is_some();
        drop(inner);
        debug!(key = %key, stale_data, "cache error recorded");
        if created && unsubscribed {
            self.emit(StoreEvent::Idle { key: key.clone(), gc_at });
        }
    }

    // ===== Subscriptions =====

    /// Attaches a subscriber, registering the latest options and fetcher.
    ///
    /// Dropping the returned handle releases the subscription; the last
    /// release arms the gc timer for the entry.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        key: &QueryKey,
        options: QueryOptions,
        fetcher: Option<QueryFetcher>,
    ) -> (SubscriptionHandle, watch::Receiver<QuerySnapshot>, QuerySnapshot) {
        let mut inner = self.lock();
        let (entry, _created) = inner.upsert_entry(key, options.clone());
        entry.options = options;
        if let Some(fetcher) = fetcher {
            entry.fetcher = Some(fetcher);
        }
        entry.subscriber_count += 1;
        let first = entry.subscriber_count == 1;
        let stale = entry.is_stale(Instant::now());
        let refetch_interval = entry.options.refetch_interval;
        let rx = entry.watch();
        let snapshot = entry.snapshot();
        drop(inner);

        trace!(key = %key, first, "subscriber attached");
        self.emit(StoreEvent::Subscribed {
            key: key.clone(),
            first,
            stale,
            refetch_interval,
        });
        let handle = SubscriptionHandle {
            store: Arc::clone(self),
            key: key.clone(),
        };
        (handle, rx, snapshot)
    }

    /// Drops one subscription; at zero the gc timer is armed.
    fn release(&self, key: &QueryKey) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        let idle = entry.subscriber_count == 0;
        let gc_at = Instant::now() + entry.options.gc_time;
        drop(inner);

        trace!(key = %key, idle, "subscriber released");
        if idle {
            self.emit(StoreEvent::Idle { key: key.clone(), gc_at });
        }
    }

    // ===== Invalidation and lifecycle =====

    /// Marks every entry whose key starts with `prefix` as stale and bumps
    /// its generation, so in-flight completions for the old contents are
    /// dropped. Subscribed entries get a refetch trigger.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut inner = self.lock();
        let mut refetch = Vec::new();
        let mut matched = 0;
        let mut generation = inner.next_generation;
        for (key, entry) in inner.entries.iter_mut() {
            if !key.starts_with(prefix) {
                continue;
            }
            matched += 1;
            entry.invalidated = true;
            entry.generation = generation;
            generation += 1;
            if entry.subscriber_count > 0 {
                refetch.push(key.clone());
            }
        }
        inner.next_generation = generation;
        drop(inner);

        debug!(prefix = %prefix, matched, "invalidated");
        for key in refetch {
            self.emit(StoreEvent::Invalidated { key });
        }
        matched
    }

    /// Marks a fetch episode running. Returns the generation the episode
    /// must present when completing, plus the registered fetcher. `None`
    /// when the entry disappeared.
    pub(crate) fn begin_fetch(&self, key: &QueryKey) -> Option<(u64, Option<QueryFetcher>)> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(key)?;
        entry.status = QueryStatus::Fetching;
        entry.notify();
        Some((entry.generation, entry.fetcher.clone()))
    }

    /// Applies a fetch completion if the entry still exists at the same
    /// generation. Superseded or orphaned completions are dropped. The
    /// check and the write share one lock scope, so a `clear` or
    /// `invalidate` cannot slip between them; a completion never creates
    /// an entry.
    pub(crate) fn complete_fetch(
        &self,
        key: &QueryKey,
        generation: u64,
        result: &FetchResult,
    ) -> Option<QuerySnapshot> {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = match inner.entries.get_mut(key) {
            Some(entry) if entry.generation == generation => entry,
            _ => {
                drop(inner);
                debug!(key = %key, generation, "stale completion dropped");
                return None;
            }
        };
        match result {
            Ok(value) => entry.record_success(value.clone(), now),
            Err(error) => entry.record_error(error.clone()),
        }
        let snapshot = entry.snapshot();
        let stale_data = snapshot.is_error() && snapshot.data.is_some();
        drop(inner);
        debug!(key = %key, stale_data, "fetch completion applied");
        Some(snapshot)
    }

    /// Flags that a revalidation was wanted while offline; the reconnect
    /// sweep picks it up.
    pub(crate) fn defer(&self, key: &QueryKey) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.deferred = true;
            drop(inner);
            debug!(key = %key, "revalidation deferred while offline");
        }
    }

    /// Keys to refetch when connectivity returns: everything deferred,
    /// plus stale subscribed entries that opted into reconnect refetch.
    /// Deferred flags are consumed.
    pub(crate) fn reconnect_keys(&self) -> Vec<QueryKey> {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut keys = Vec::new();
        for (key, entry) in inner.entries.iter_mut() {
            let deferred = std::mem::take(&mut entry.deferred);
            let wants_reconnect = entry.subscriber_count > 0
                && entry.options.refetch_on_reconnect
                && entry.is_stale(now);
            if deferred || wants_reconnect {
                keys.push(key.clone());
            }
        }
        drop(inner);
        keys
    }

    /// Removes the entry if it still has no subscribers. Called by the
    /// scheduler when a gc deadline survives its epoch checks.
    pub(crate) fn evict_if_idle(&self, key: &QueryKey) -> bool {
        let mut inner = self.lock();
        let idle = inner
            .entries
            .get(key)
            .map(|e| e.subscriber_count == 0)
            .unwrap_or(false);
        if idle {
            inner.entries.remove(key);
        }
        drop(inner);
        if idle {
            debug!(key = %key, "entry evicted");
        }
        idle
    }

    /// Drops every entry. Subscribers observe their channels closing.
    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        drop(inner);
        info!(count, "cache cleared");
        self.emit(StoreEvent::Cleared);
    }

    /// Upserts the entry for a fetch episode and decides whether a fetch
    /// is warranted. Latest options and fetcher always win.
    pub(crate) fn prepare_fetch(
        &self,
        key: &QueryKey,
        options: QueryOptions,
        fetcher: QueryFetcher,
    ) -> PrepareOutcome {
        let now = Instant::now();
        let mut inner = self.lock();
        let (entry, created) = inner.upsert_entry(key, options.clone());
        entry.options = options;
        entry.fetcher = Some(fetcher);
        let snapshot = entry.snapshot();
        let fresh = entry.status == QueryStatus::Success && !entry.is_stale(now);
        let generation = entry.generation;
        let gc_at = now + entry.options.gc_time;
        let unsubscribed = entry.subscriber_count == 0;
        drop(inner);

        if created && unsubscribed {
            self.emit(StoreEvent::Idle { key: key.clone(), gc_at });
        }
        if fresh {
            trace!(key = %key, "fresh hit");
            PrepareOutcome::Fresh(snapshot)
        } else {
            PrepareOutcome::Fetch { snapshot, generation }
        }
    }
}

impl StoreInner {
    /// Returns the entry for `key`, creating it (with a fresh generation)
    /// when absent. The bool reports whether a creation happened.
    fn upsert_entry(&mut self, key: &QueryKey, options: QueryOptions) -> (&mut CacheEntry, bool) {
        let StoreInner {
            entries,
            next_generation,
        } = self;
        let mut created = false;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            created = true;
            let generation = *next_generation;
            *next_generation += 1;
            CacheEntry::new(options, generation)
        });
        (entry, created)
    }
}

/// Keeps one subscription alive; dropping it releases the subscriber and,
/// at zero subscribers, arms the entry's gc timer.
pub struct SubscriptionHandle {
    store: Arc<QueryStore>,
    key: QueryKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn test_store() -> (Arc<QueryStore>, mpsc::UnboundedReceiver<StoreEvent>) {
        QueryStore::new()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_get() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        assert!(store.get(&key).is_none());

        store.put(&key, json!([{"id": 1}]));
        let snapshot = store.get(&key).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert!(snapshot.data.is_some());
        assert!(snapshot.error.is_none());
        assert!(snapshot.fetched_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_error_preserves_data() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        store.put(&key, json!([{"id": 1}]));
        store.put_error(&key, QueryError::Transient("503".into()));

        let snapshot = store.get(&key).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert!(snapshot.data.is_some(), "stale data served alongside error");
        assert!(snapshot.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_previous_error() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        store.put_error(&key, QueryError::Transient("503".into()));
        store.put(&key, json!([]));

        let snapshot = store.get(&key).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_events_and_gc_arming() {
        let (store, mut rx) = test_store();
        let key = QueryKey::root("orders");
        let options = QueryOptions::default().with_gc_time(Duration::from_secs(60));

        let (first, _watch1, _snap) = store.subscribe(&key, options.clone(), None);
        let (second, _watch2, _snap) = store.subscribe(&key, options, None);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            StoreEvent::Subscribed { first: true, .. }
        ));
        assert!(matches!(
            &events[1],
            StoreEvent::Subscribed { first: false, .. }
        ));

        drop(second);
        assert!(drain(&mut rx).is_empty(), "no gc arming while subscribed");

        let before = Instant::now();
        drop(first);
        let events = drain(&mut rx);
        match &events[..] {
            [StoreEvent::Idle { key: k, gc_at }] => {
                assert_eq!(k, &key);
                assert_eq!(gc_at.duration_since(before), Duration::from_secs(60));
            }
            other => panic!("expected Idle event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_window() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(30));
        let (_handle, _watch, _snap) = store.subscribe(&key, options, None);
        store.put(&key, json!([]));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!store.is_stale(&key));

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(store.is_stale(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix_marks_stale_and_bumps_generation() {
        let (store, mut rx) = test_store();
        let orders = QueryKey::root("orders");
        let count = QueryKey::root("orders").join("count");
        let users = QueryKey::root("users");
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(3600));

        let (_h, _w, _s) = store.subscribe(&orders, options.clone(), None);
        store.put(&orders, json!([]));
        store.put(&count, json!({"count": 4}));
        store.put(&users, json!([]));
        let old_generation = store.current_generation(&orders).unwrap();
        drain(&mut rx);

        let matched = store.invalidate(&QueryKey::root("orders"));
        assert_eq!(matched, 2);
        assert!(store.is_stale(&orders));
        assert!(store.is_stale(&count));
        assert!(!store.is_stale(&users));
        assert!(store.current_generation(&orders).unwrap() > old_generation);

        let events = drain(&mut rx);
        let refetches: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StoreEvent::Invalidated { .. }))
            .collect();
        assert_eq!(refetches.len(), 1, "only the subscribed entry refetches");
        assert!(
            matches!(refetches[0], StoreEvent::Invalidated { key } if *key == orders)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_completion_is_dropped() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        store.put(&key, json!({"v": 1}));
        let generation = store.current_generation(&key).unwrap();

        store.invalidate(&key);
        let applied = store.complete_fetch(&key, generation, &Ok(json!({"v": 2})));
        assert!(applied.is_none());
        let snapshot = store.get(&key).unwrap();
        assert_eq!(snapshot.data_as::<serde_json::Value>().unwrap().unwrap()["v"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_after_clear_is_dropped() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        store.put(&key, json!({"v": 1}));
        let generation = store.current_generation(&key).unwrap();

        store.clear();
        assert!(store.complete_fetch(&key, generation, &Ok(json!({"v": 2}))).is_none());
        assert!(store.get(&key).is_none(), "completion must not resurrect entries");
    }

    #[test]
    fn test_clear_racing_completion_never_resurrects() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        for round in 0..200 {
            store.put(&key, json!({"round": round}));
            let generation = store.current_generation(&key).unwrap();
            let barrier = Barrier::new(2);
            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    store.complete_fetch(&key, generation, &Ok(json!({"round": round})));
                });
                s.spawn(|| {
                    barrier.wait();
                    store.clear();
                });
            });
            assert!(
                store.get(&key).is_none(),
                "round {}: completion applied after clear",
                round
            );
        }
    }

    #[test]
    fn test_invalidate_racing_completion_stays_stale() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(3600));
        let (_handle, _watch, _snap) = store.subscribe(&key, options, None);
        for round in 0..200 {
            store.put(&key, json!({"round": round}));
            assert!(!store.is_stale(&key));
            let generation = store.current_generation(&key).unwrap();
            let barrier = Barrier::new(2);
            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    store.complete_fetch(&key, generation, &Ok(json!({"round": round})));
                });
                s.spawn(|| {
                    barrier.wait();
                    store.invalidate(&key);
                });
            });
            assert!(
                store.is_stale(&key),
                "round {}: invalidation erased by completion",
                round
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_if_idle_respects_subscribers() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        let (handle, _watch, _snap) = store.subscribe(&key, QueryOptions::default(), None);
        store.put(&key, json!([]));

        assert!(!store.evict_if_idle(&key));
        drop(handle);
        assert!(store.evict_if_idle(&key));
        assert!(store.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_store() {
        let (store, mut rx) = test_store();
        store.put(&QueryKey::root("orders"), json!([]));
        store.put(&QueryKey::root("users"), json!([]));
        drain(&mut rx);

        store.clear();
        assert!(store.is_empty());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StoreEvent::Cleared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keys() {
        let (store, _rx) = test_store();
        let deferred = QueryKey::root("orders");
        let stale_subscribed = QueryKey::root("users");
        let opted_out = QueryKey::root("vehicles");
        let fresh = QueryKey::root("appointments");

        store.put(&deferred, json!([]));
        store.defer(&deferred);

        let stale_opts = QueryOptions::default().with_stale_time(Duration::ZERO);
        let (_h1, _w1, _s1) = store.subscribe(&stale_subscribed, stale_opts.clone(), None);
        store.put(&stale_subscribed, json!([]));

        let no_reconnect = stale_opts.clone().with_refetch_on_reconnect(false);
        let (_h2, _w2, _s2) = store.subscribe(&opted_out, no_reconnect, None);
        store.put(&opted_out, json!([]));

        let fresh_opts = QueryOptions::default().with_stale_time(Duration::from_secs(3600));
        let (_h3, _w3, _s3) = store.subscribe(&fresh, fresh_opts, None);
        store.put(&fresh, json!([]));

        tokio::time::advance(Duration::from_millis(10)).await;
        let mut keys = store.reconnect_keys();
        keys.sort_by_key(|k| k.to_string());
        assert_eq!(keys, vec![deferred.clone(), stale_subscribed]);

        assert!(
            !store.reconnect_keys().contains(&deferred),
            "deferred flag is consumed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_notifies_on_put() {
        let (store, _rx) = test_store();
        let key = QueryKey::root("orders");
        let (_handle, mut watch_rx, snapshot) = store.subscribe(&key, QueryOptions::default(), None);
        assert_eq!(snapshot.status, QueryStatus::Idle);

        store.put(&key, json!({"ready": true}));
        watch_rx.changed().await.unwrap();
        let snapshot = watch_rx.borrow().clone();
        assert_eq!(snapshot.status, QueryStatus::Success);
    }
}
