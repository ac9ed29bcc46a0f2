//! Consumer-facing handle over the cache engine.
//!
//! `QueryClient` wires the store, the fetch coordinator, and the
//! revalidation scheduler together and is the only type embedders touch
//! for day-to-day reads. `QueryObserver` is the live view a subscriber
//! holds: current snapshot plus change notifications, releasing its
//! subscription on drop.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::net::NetworkHandle;

use super::coordinator::{FetchCoordinator, DEFAULT_RETRY_BACKOFF};
use super::entry::{QueryFetcher, QueryOptions, QuerySnapshot, QueryStatus};
use super::error::QueryError;
use super::key::QueryKey;
use super::scheduler::RevalidationScheduler;
use super::store::{QueryStore, SubscriptionHandle};

/// Front door to the cache and synchronization engine.
///
/// Construct one per session scope, inside a tokio runtime. Dropping the
/// last handle stops the scheduler task.
pub struct QueryClient {
    store: Arc<QueryStore>,
    coordinator: Arc<FetchCoordinator>,
    network: NetworkHandle,
    session_gate: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
}

impl QueryClient {
    pub fn new(network: NetworkHandle) -> Arc<Self> {
        Self::with_retry_backoff(network, DEFAULT_RETRY_BACKOFF)
    }

    /// Same as [`new`](Self::new) with the transient-retry backoff
    /// overridden, for embedders that tune engine timings from config.
    pub fn with_retry_backoff(network: NetworkHandle, retry_backoff: Duration) -> Arc<Self> {
        let (store, events) = QueryStore::new();
        let coordinator =
            FetchCoordinator::new(Arc::clone(&store), network.clone(), retry_backoff);
        let (session_gate, gate_rx) = watch::channel(true);
        let scheduler = RevalidationScheduler::spawn(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            network.clone(),
            events,
            gate_rx,
        );
        Arc::new(QueryClient {
            store,
            coordinator,
            network,
            session_gate,
            scheduler,
        })
    }

    /// Subscribes to `key` and keeps it fresh for as long as the returned
    /// observer lives. Stale or missing data starts a fetch immediately;
    /// the observer sees every snapshot change.
    pub fn query(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: QueryFetcher,
        options: QueryOptions,
    ) -> QueryObserver {
        let (handle, rx, _snapshot) = self.store.subscribe(key, options, Some(fetcher));
        if self.store.is_stale(key) {
            self.coordinator.spawn_refetch(key.clone());
        }
        QueryObserver { handle, rx }
    }

    /// One-shot read: serves a fresh hit from cache, otherwise fetches
    /// (joining any in-flight request) and returns the settled snapshot.
    /// Offline the request is deferred and the current snapshot returned.
    pub async fn fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: QueryFetcher,
        options: QueryOptions,
    ) -> QuerySnapshot {
        self.coordinator.ensure_fresh(key, fetcher, options).await
    }

    /// Populates the cache without subscribing. The entry gcs on the
    /// default deadline unless somebody subscribes before it expires.
    pub async fn prefetch(self: &Arc<Self>, key: &QueryKey, fetcher: QueryFetcher) -> QuerySnapshot {
        self.coordinator
            .ensure_fresh(key, fetcher, QueryOptions::default())
            .await
    }

    /// Marks every entry under `prefix` stale; subscribed ones refetch.
    /// Returns how many entries matched.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        self.store.invalidate(prefix)
    }

    pub fn get(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        self.store.get(key)
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.store.is_stale(key)
    }

    /// Drops every cached entry. Observers see their channels close.
    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    /// Opens or closes the background-revalidation gate. The session
    /// lifecycle closes it while unauthenticated.
    pub(crate) fn set_session_gate(&self, open: bool) {
        let changed = self.session_gate.send_if_modified(|gate| {
            let flip = *gate != open;
            if flip {
                *gate = open;
            }
            flip
        });
        if changed {
            debug!(open, "session gate changed");
        }
    }

    /// Bumped once per fetch episode that hit an authorization failure.
    pub(crate) fn auth_failures(&self) -> watch::Receiver<u64> {
        self.coordinator.auth_failures()
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.scheduler.abort();
    }
}

// ===== Observer =====

/// Live subscription to one query.
///
/// Dropping the observer releases the subscription; the last release
/// arms the entry's gc deadline.
pub struct QueryObserver {
    handle: SubscriptionHandle,
    rx: watch::Receiver<QuerySnapshot>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        self.handle.key()
    }

    /// Current snapshot, cloned out of the watch channel.
    pub fn snapshot(&self) -> QuerySnapshot {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.rx.borrow().status
    }

    /// Deserializes the current data, if any.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, QueryError> {
        self.rx.borrow().data_as()
    }

    /// Resolves with the next snapshot change, or `None` once the entry
    /// is gone (store cleared or evicted).
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Waits until the query settles in Success or Error and returns that
    /// snapshot. While offline this resolves only after the deferred
    /// fetch runs.
    pub async fn settled(&mut self) -> QuerySnapshot {
        loop {
            let snapshot = self.rx.borrow_and_update().clone();
            if matches!(snapshot.status, QueryStatus::Success | QueryStatus::Error) {
                return snapshot;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_fetcher(calls: Arc<AtomicUsize>, value: Value) -> QueryFetcher {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    /// Fetcher whose payload carries the invocation ordinal.
    fn versioned_fetcher(calls: Arc<AtomicUsize>) -> QueryFetcher {
        Arc::new(move || {
            let version = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok(json!({ "version": version })) })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_settles_with_fetched_data() {
        let client = QueryClient::new(NetworkHandle::always_online());
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut observer = client.query(
            &key,
            counting_fetcher(calls.clone(), json!([{"id": 1}])),
            QueryOptions::default(),
        );
        let snapshot = observer.settled().await;

        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let orders: Option<Value> = observer.data_as().unwrap();
        assert_eq!(orders.unwrap()[0]["id"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_query_serves_cache_without_fetching() {
        let client = QueryClient::new(NetworkHandle::always_online());
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(calls.clone(), json!([{"id": 1}]));
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(60));

        client.fetch(&key, fetcher.clone(), options.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut observer = client.query(&key, fetcher, options);
        let snapshot = observer.settled().await;
        sleep(Duration::from_millis(5)).await;

        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh hit skips the fetch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_pushes_new_snapshot_to_observer() {
        let client = QueryClient::new(NetworkHandle::always_online());
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(300));

        let mut observer = client.query(&key, versioned_fetcher(calls.clone()), options);
        let first = observer.settled().await;
        assert_eq!(first.data_as::<Value>().unwrap().unwrap()["version"], 1);

        client.invalidate(&key);
        let refetched = loop {
            let Some(snapshot) = observer.changed().await else {
                panic!("observer channel closed before refetch");
            };
            if snapshot.status == QueryStatus::Success
                && snapshot.data_as::<Value>().unwrap().unwrap()["version"] == 2
            {
                break snapshot;
            }
        };

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refetched.status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_closes_observer_channel() {
        let client = QueryClient::new(NetworkHandle::always_online());
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut observer = client.query(
            &key,
            counting_fetcher(calls.clone(), json!([])),
            QueryOptions::default(),
        );
        observer.settled().await;

        client.clear();
        assert!(client.get(&key).is_none());
        assert!(observer.changed().await.is_none(), "entry dropped with the store");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetched_entry_expires_unless_subscribed() {
        let client = QueryClient::new(NetworkHandle::always_online());
        let key = QueryKey::root("users");
        let calls = Arc::new(AtomicUsize::new(0));

        let snapshot = client
            .prefetch(&key, counting_fetcher(calls.clone(), json!([{"id": 9}])))
            .await;
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert!(client.get(&key).is_some());

        sleep(Duration::from_secs(301)).await;
        assert!(client.get(&key).is_none(), "unsubscribed prefetch gcs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_observer_arms_gc() {
        let client = QueryClient::new(NetworkHandle::always_online());
        let key = QueryKey::root("appointments");
        let calls = Arc::new(AtomicUsize::new(0));
        let options = QueryOptions::default().with_gc_time(Duration::from_secs(30));

        let mut observer = client.query(
            &key,
            counting_fetcher(calls.clone(), json!([])),
            options,
        );
        observer.settled().await;
        drop(observer);
        sleep(Duration::from_millis(5)).await;

        sleep(Duration::from_secs(31)).await;
        assert!(client.get(&key).is_none(), "entry gone once gc_time passes");
    }
}
