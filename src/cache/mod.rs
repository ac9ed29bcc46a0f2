//! Client-side cache and synchronization engine.
//!
//! This module provides the `QueryClient` embedders use for every read:
//! subscribe to a key, get served from cache while fresh, and let the
//! engine revalidate in the background. The moving parts:
//! - `QueryStore`: keyed entries with staleness, subscriptions, and gc
//! - `FetchCoordinator`: one in-flight fetch per key, retry, generations
//! - `RevalidationScheduler`: interval, reconnect, mount, and
//!   invalidation triggers behind a single timer task
//!
//! Data is cached as JSON values and considered stale per-query after
//! `stale_time`; unsubscribed entries are evicted after `gc_time`.

pub mod client;
mod coordinator;
pub mod entry;
pub mod error;
pub mod key;
mod scheduler;
pub mod store;

pub use client::{QueryClient, QueryObserver};
pub use entry::{FetchResult, QueryFetcher, QueryOptions, QuerySnapshot, QueryStatus};
pub use error::QueryError;
pub use key::{KeySegment, QueryKey};
pub use store::{QueryStore, SubscriptionHandle};

#[cfg(test)]
mod property_tests;
