//! Fetch coordination: deduplication, retry, and completion guarding.
//!
//! Every fetch funnels through [`FetchCoordinator::ensure_fresh`]. A fresh
//! cache hit short-circuits; a stale or missing entry either joins the one
//! in-flight request for its key or starts a new one. Transient failures
//! get a single retry after a fixed backoff, then surface through the
//! snapshot. Completions carry the generation they started under and are
//! dropped when invalidation or logout superseded them mid-flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::net::NetworkHandle;

use super::entry::{FetchResult, QueryFetcher, QueryOptions, QuerySnapshot, QueryStatus};
use super::key::QueryKey;
use super::store::{PrepareOutcome, QueryStore};

/// Default pause before the single retry of a transient failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The one running fetch for a key. Joiners clone `done` and await the
/// published snapshot.
struct InFlightRequest {
    generation: u64,
    done: watch::Receiver<Option<QuerySnapshot>>,
}

pub struct FetchCoordinator {
    store: Arc<QueryStore>,
    network: NetworkHandle,
    in_flight: Mutex<HashMap<QueryKey, InFlightRequest>>,
    retry_backoff: Duration,
    /// Bumped once per fetch episode that surfaced an authorization
    /// failure; the session layer watches the counter.
    auth_failures: watch::Sender<u64>,
}

impl FetchCoordinator {
    pub(crate) fn new(
        store: Arc<QueryStore>,
        network: NetworkHandle,
        retry_backoff: Duration,
    ) -> Arc<Self> {
        let (auth_failures, _) = watch::channel(0);
        Arc::new(FetchCoordinator {
            store,
            network,
            in_flight: Mutex::new(HashMap::new()),
            retry_backoff,
            auth_failures,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, InFlightRequest>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn auth_failures(&self) -> watch::Receiver<u64> {
        self.auth_failures.subscribe()
    }

    /// Serves `key` from cache when fresh, otherwise ensures exactly one
    /// fetch episode is running and awaits its outcome. Never panics; all
    /// failures come back inside the snapshot.
    pub(crate) async fn ensure_fresh(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: QueryFetcher,
        options: QueryOptions,
    ) -> QuerySnapshot {
        match self.store.prepare_fetch(key, options, fetcher) {
            PrepareOutcome::Fresh(snapshot) => snapshot,
            PrepareOutcome::Fetch { snapshot, .. } => {
                if !self.network.is_online() {
                    self.store.defer(key);
                    debug!(key = %key, "fetch deferred while offline");
                    return snapshot;
                }
                self.run_or_join(key).await
            }
        }
    }

    /// Background revalidation of a key using its registered fetcher.
    /// No-op when the entry is gone or never had a fetcher.
    pub(crate) async fn refetch(self: &Arc<Self>, key: &QueryKey) -> Option<QuerySnapshot> {
        let (fetcher, options) = self.store.refetch_context(key)?;
        Some(self.ensure_fresh(key, fetcher, options).await)
    }

    /// Spawns `refetch` without blocking the caller.
    pub(crate) fn spawn_refetch(self: &Arc<Self>, key: QueryKey) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.refetch(&key).await;
        });
    }

    async fn run_or_join(self: &Arc<Self>, key: &QueryKey) -> QuerySnapshot {
        let mut done = {
            let mut in_flight = self.lock();
            let Some(generation) = self.store.current_generation(key) else {
                return self.latest(key);
            };
            match in_flight.get(key) {
                Some(existing) if existing.generation == generation => {
                    debug!(key = %key, "joining in-flight fetch");
                    existing.done.clone()
                }
                _ => match self.spawn_fetch(&mut in_flight, key) {
                    Some(done) => done,
                    None => return self.latest(key),
                },
            }
        };

        loop {
            let published = done.borrow_and_update().clone();
            if let Some(snapshot) = published {
                return snapshot;
            }
            if done.changed().await.is_err() {
                return self.latest(key);
            }
        }
    }

    /// Starts the fetch task for `key`, replacing any superseded in-flight
    /// record. Returns `None` when the entry vanished or carries no
    /// fetcher.
    fn spawn_fetch(
        self: &Arc<Self>,
        in_flight: &mut HashMap<QueryKey, InFlightRequest>,
        key: &QueryKey,
    ) -> Option<watch::Receiver<Option<QuerySnapshot>>> {
        let (generation, fetcher) = self.store.begin_fetch(key)?;
        let Some(fetcher) = fetcher else {
            warn!(key = %key, "no fetcher registered");
            return None;
        };
        let (done_tx, done_rx) = watch::channel(None);
        in_flight.insert(
            key.clone(),
            InFlightRequest {
                generation,
                done: done_rx.clone(),
            },
        );
        debug!(key = %key, generation, "fetch started");
        let coordinator = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            coordinator.run_fetch(key, fetcher, generation, done_tx).await;
        });
        Some(done_rx)
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: QueryKey,
        fetcher: QueryFetcher,
        generation: u64,
        done: watch::Sender<Option<QuerySnapshot>>,
    ) {
        let mut result = fetcher().await;
        if matches!(&result, Err(error) if error.is_transient()) {
            debug!(
                key = %key,
                backoff_ms = self.retry_backoff.as_millis() as u64,
                "transient failure, retrying once"
            );
            sleep(self.retry_backoff).await;
            result = fetcher().await;
        }

        if let Err(error) = &result {
            warn!(key = %key, error = %error, "fetch failed");
            if error.is_transient() {
                self.network.suspect_offline();
            }
            if error.is_unauthorized() {
                self.auth_failures.send_modify(|count| *count += 1);
            }
        }

        let applied = self.store.complete_fetch(&key, generation, &result);
        {
            let mut in_flight = self.lock();
            if in_flight.get(&key).map(|r| r.generation) == Some(generation) {
                in_flight.remove(&key);
            }
        }
        // Joiners of a superseded episode still get its outcome even
        // though the cache write was dropped.
        let snapshot = applied.unwrap_or_else(|| discarded_snapshot(&result));
        done.send_replace(Some(snapshot));
    }

    fn latest(&self, key: &QueryKey) -> QuerySnapshot {
        self.store.get(key).unwrap_or_else(QuerySnapshot::absent)
    }
}

/// Snapshot handed to waiters whose completion was not applied to the
/// store.
fn discarded_snapshot(result: &FetchResult) -> QuerySnapshot {
    match result {
        Ok(value) => QuerySnapshot {
            data: Some(Arc::new(value.clone())),
            error: None,
            status: QueryStatus::Success,
            fetched_at: Some(chrono::Utc::now()),
        },
        Err(error) => QuerySnapshot {
            data: None,
            error: Some(Arc::new(error.clone())),
            status: QueryStatus::Error,
            fetched_at: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::error::QueryError;
    use crate::net;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch::Sender;

    fn setup() -> (Arc<QueryStore>, Arc<FetchCoordinator>, Sender<net::Connectivity>) {
        let (store, _events) = QueryStore::new();
        let (handle, net_tx) = net::manual_handle();
        let coordinator =
            FetchCoordinator::new(Arc::clone(&store), handle, DEFAULT_RETRY_BACKOFF);
        (store, coordinator, net_tx)
    }

    /// Fetcher that counts invocations and resolves `value` after `delay`.
    fn slow_fetcher(calls: Arc<AtomicUsize>, value: Value, delay: Duration) -> QueryFetcher {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            Box::pin(async move {
                sleep(delay).await;
                Ok(value)
            })
        })
    }

    /// Fetcher that fails `failures` times with a transient error, then
    /// succeeds. Resolves immediately.
    fn flaky_fetcher(calls: Arc<AtomicUsize>, failures: usize, value: Value) -> QueryFetcher {
        Arc::new(move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            Box::pin(async move {
                if attempt < failures {
                    Err(QueryError::Transient("connection refused".into()))
                } else {
                    Ok(value)
                }
            })
        })
    }

    fn erroring_fetcher(calls: Arc<AtomicUsize>, error: QueryError) -> QueryFetcher {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            Box::pin(async move { Err(error) })
        })
    }

    /// Fetcher whose payload records which invocation produced it.
    fn attempt_tagged_fetcher(calls: Arc<AtomicUsize>, delay: Duration) -> QueryFetcher {
        Arc::new(move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                sleep(delay).await;
                Ok(json!({ "attempt": attempt }))
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_then_serves_fresh_hit() {
        let (_store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_fetcher(calls.clone(), json!([{"id": 1}]), Duration::ZERO);
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(60));

        let first = coordinator
            .ensure_fresh(&key, fetcher.clone(), options.clone())
            .await;
        assert_eq!(first.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = coordinator.ensure_fresh(&key, fetcher, options).await;
        assert_eq!(second.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh hit does not fetch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_demands_share_one_fetch() {
        let (_store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_fetcher(
            calls.clone(),
            json!([{"id": 1}]),
            Duration::from_millis(100),
        );

        let (a, b) = tokio::join!(
            coordinator.ensure_fresh(&key, fetcher.clone(), QueryOptions::default()),
            coordinator.ensure_fresh(&key, fetcher.clone(), QueryOptions::default()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1, "joiner reuses the in-flight fetch");
        assert_eq!(a.status, QueryStatus::Success);
        assert_eq!(b.status, QueryStatus::Success);
        assert_eq!(a.data_as::<Value>().unwrap(), b.data_as::<Value>().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_once_then_succeeds() {
        let (_store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = flaky_fetcher(calls.clone(), 1, json!([]));

        let start = tokio::time::Instant::now();
        let snapshot = coordinator
            .ensure_fresh(&key, fetcher, QueryOptions::default())
            .await;

        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(
            start.elapsed() >= DEFAULT_RETRY_BACKOFF,
            "retry waits out the backoff"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_transient_failure_surfaces_with_stale_data() {
        let (store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        store.put(&key, json!([{"id": 1}]));
        store.invalidate(&key);

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = erroring_fetcher(calls.clone(), QueryError::Transient("503".into()));
        let snapshot = coordinator
            .ensure_fresh(&key, fetcher, QueryOptions::default())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly one retry");
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert!(snapshot.error.is_some());
        assert!(snapshot.data.is_some(), "stale data kept alongside the error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried_and_pulses_session_layer() {
        let (_store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = erroring_fetcher(calls.clone(), QueryError::Unauthorized);
        let auth_rx = coordinator.auth_failures();
        assert_eq!(*auth_rx.borrow(), 0);

        let snapshot = coordinator
            .ensure_fresh(&key, fetcher, QueryOptions::default())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "authorization failures never retry");
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert_eq!(*auth_rx.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_defers_instead_of_fetching() {
        let (store, coordinator, net_tx) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_fetcher(calls.clone(), json!([]), Duration::ZERO);

        net_tx.send_replace(net::Connectivity::Offline);
        let snapshot = coordinator
            .ensure_fresh(&key, fetcher, QueryOptions::default())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "no fetch starts while offline");
        assert_eq!(snapshot.status, QueryStatus::Idle);
        assert_eq!(store.reconnect_keys(), vec![key], "request deferred, not dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_supersedes_in_flight_completion() {
        let (store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = attempt_tagged_fetcher(calls.clone(), Duration::from_secs(5));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            let key = key.clone();
            let fetcher = fetcher.clone();
            tokio::spawn(async move {
                coordinator
                    .ensure_fresh(&key, fetcher, QueryOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.invalidate(&key);
        let second = coordinator
            .ensure_fresh(&key, fetcher, QueryOptions::default())
            .await;
        let first = first.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2, "superseded episode forces a new fetch");
        assert_eq!(second.data_as::<Value>().unwrap().unwrap()["attempt"], 2);
        let cached = store.get(&key).unwrap();
        assert_eq!(
            cached.data_as::<Value>().unwrap().unwrap()["attempt"],
            2,
            "stale completion must not overwrite the newer one"
        );
        assert_eq!(
            first.data_as::<Value>().unwrap().unwrap()["attempt"],
            1,
            "waiters of the superseded episode still see its outcome"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_fetch_drops_completion_but_resolves_waiter() {
        let (store, coordinator, _net) = setup();
        let key = QueryKey::root("orders");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_fetcher(calls.clone(), json!([]), Duration::from_secs(5));

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            let key = key.clone();
            tokio::spawn(async move {
                coordinator
                    .ensure_fresh(&key, fetcher, QueryOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear();

        let snapshot = pending.await.unwrap();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert!(store.get(&key).is_none(), "cleared store stays empty");
    }
}
