//! Cache entries, query status, snapshots, and per-query options.
//!
//! A [`CacheEntry`] is the store-side record for one
//! [`QueryKey`](super::key::QueryKey): the last
//! fetched payload, the last error, lifecycle status, staleness bookkeeping,
//! and the registered fetcher used for background refetches. Consumers never
//! see entries directly; reads produce a [`QuerySnapshot`] and subscribers
//! receive snapshots over a watch channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::error::QueryError;

/// Result of one fetcher invocation.
pub type FetchResult = Result<Value, QueryError>;

/// A registered fetch function: cheap to clone, invoked for the initial
/// load and for every background refetch of its key.
pub type QueryFetcher = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;

/// Default gc window: entries unused for five minutes are evicted.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(300);

// ===== Status =====

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Created but never fetched.
    Idle,
    /// A fetch episode is running; previous data and error remain visible.
    Fetching,
    /// Last fetch succeeded; data is present.
    Success,
    /// Last fetch failed; error is present, earlier data may still be served.
    Error,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Fetching => write!(f, "fetching"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

// ===== Options =====

/// Per-query behavior knobs.
///
/// Durations are carried as milliseconds on the wire, matching the option
/// object the UI passes. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueryOptions {
    /// Window after a successful fetch during which the entry is fresh.
    #[serde(rename = "staleTime", with = "duration_ms")]
    pub stale_time: Duration,
    /// How long an entry with zero subscribers survives before eviction.
    #[serde(rename = "gcTime", with = "duration_ms")]
    pub gc_time: Duration,
    /// Optional periodic refetch while subscribed and online.
    #[serde(rename = "refetchIntervalMs", with = "opt_duration_ms")]
    pub refetch_interval: Option<Duration>,
    /// Refetch stale subscribed entries when connectivity returns.
    #[serde(rename = "refetchOnReconnect")]
    pub refetch_on_reconnect: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            stale_time: Duration::ZERO,
            gc_time: DEFAULT_GC_TIME,
            refetch_interval: None,
            refetch_on_reconnect: true,
        }
    }
}

impl QueryOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = refetch;
        self
    }
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ===== Snapshot =====

/// Consumer-visible view of one cache entry.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub data: Option<Arc<Value>>,
    pub error: Option<Arc<QueryError>>,
    pub status: QueryStatus,
    /// Wall-clock time of the last successful fetch.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl QuerySnapshot {
    /// Snapshot for a key the store has never seen.
    pub fn absent() -> Self {
        QuerySnapshot {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            fetched_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Decodes the payload into a typed value.
    ///
    /// `Ok(None)` when no data is cached; `Err` when the payload does not
    /// match the requested shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, QueryError> {
        match &self.data {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.as_ref().clone())
                .map(Some)
                .map_err(|e| QueryError::Data(e.to_string())),
        }
    }

    /// Minutes since the last successful fetch.
    pub fn age_minutes(&self) -> Option<i64> {
        self.fetched_at
            .map(|t| Utc::now().signed_duration_since(t).num_minutes())
    }

    /// Short age label for display: "2m", "3h", or "-" when never fetched.
    pub fn age_display(&self) -> String {
        match self.age_minutes() {
            None => "-".to_string(),
            Some(mins) if mins < 60 => format!("{}m", mins),
            Some(mins) => format!("{}h", mins / 60),
        }
    }
}

// ===== Entry =====

/// Store-side record for one key. Internal to the cache module; the store
/// mutates fields directly under its lock.
pub(crate) struct CacheEntry {
    pub(crate) data: Option<Arc<Value>>,
    pub(crate) error: Option<Arc<QueryError>>,
    pub(crate) status: QueryStatus,
    /// Monotonic timestamp of the last successful fetch, for staleness math.
    pub(crate) fetched_at: Option<Instant>,
    /// Wall-clock twin of `fetched_at`, for display.
    pub(crate) fetched_at_utc: Option<DateTime<Utc>>,
    /// Set by invalidation; cleared by the next successful fetch.
    pub(crate) invalidated: bool,
    /// A revalidation was requested while offline and awaits reconnect.
    pub(crate) deferred: bool,
    pub(crate) options: QueryOptions,
    pub(crate) subscriber_count: usize,
    /// Tag for the current fetch episode; completions carrying an older
    /// generation are dropped.
    pub(crate) generation: u64,
    pub(crate) fetcher: Option<QueryFetcher>,
    changed: watch::Sender<QuerySnapshot>,
}

impl CacheEntry {
    pub(crate) fn new(options: QueryOptions, generation: u64) -> Self {
        let (changed, _) = watch::channel(QuerySnapshot::absent());
        CacheEntry {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            fetched_at: None,
            fetched_at_utc: None,
            invalidated: false,
            deferred: false,
            options,
            subscriber_count: 0,
            generation,
            fetcher: None,
            changed,
        }
    }

    pub(crate) fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            fetched_at: self.fetched_at_utc,
        }
    }

    /// Applies fetched data: status success, error cleared, timestamps
    /// refreshed, invalidation and deferral flags consumed.
    pub(crate) fn record_success(&mut self, value: Value, now: Instant) {
        self.data = Some(Arc::new(value));
        self.error = None;
        self.status = QueryStatus::Success;
        self.fetched_at = Some(now);
        self.fetched_at_utc = Some(Utc::now());
        self.invalidated = false;
        self.deferred = false;
        self.notify();
    }

    /// Records a fetch failure: status error, previous data retained so
    /// consumers keep rendering stale content alongside the error.
    pub(crate) fn record_error(&mut self, error: QueryError) {
        self.error = Some(Arc::new(error));
        self.status = QueryStatus::Error;
        self.notify();
    }

    /// Publishes the current snapshot to subscribers.
    pub(crate) fn notify(&self) {
        self.changed.send_replace(self.snapshot());
    }

    pub(crate) fn watch(&self) -> watch::Receiver<QuerySnapshot> {
        self.changed.subscribe()
    }

    /// Stale when never fetched, explicitly invalidated, or older than
    /// `stale_time`. The boundary itself counts as stale.
    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.options.stale_time,
        }
    }
}
