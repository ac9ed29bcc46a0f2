//! ShopSync - client-side cache and sync engine for the workshop manager.
//!
//! This crate keeps a shop client responsive over a flaky connection: it
//! caches backend collections keyed by logical identity, serves stale data
//! while revalidating in the background, collapses concurrent fetches of
//! the same key, and defers network work while offline or signed out.
//!
//! The moving parts:
//! - [`cache`]: the query engine (store, fetch coordinator, scheduler)
//! - [`net`]: online/offline monitoring with active probing
//! - [`auth`]: session lifecycle, credential storage, encrypted session file
//! - [`api`]: the concrete REST client for the shop backend
//! - [`queries`]: canonical keys, fetchers, and mutation helpers
//! - [`models`], [`summaries`], [`utils`]: domain types and pure helpers
//!
//! No tracing subscriber is installed here; embedders configure logging.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod net;
pub mod queries;
pub mod summaries;
pub mod utils;

pub use api::{ApiClient, ApiError, AppointmentDraft};
pub use auth::{
    AuthBackend, Credentials, PrefetchQuery, SessionData, SessionManager, SessionState,
    SessionVault,
};
pub use cache::{
    QueryClient, QueryError, QueryFetcher, QueryKey, QueryObserver, QueryOptions, QuerySnapshot,
    QueryStatus,
};
pub use config::Config;
pub use net::{
    Connectivity, ConnectivityProbe, HttpProbe, NetworkConfig, NetworkHandle, NetworkMonitor,
};
