//! Session lifecycle: sign-in, sign-out, restore, and forced sign-out.
//!
//! The manager owns the authenticated/unauthenticated transition and
//! everything tied to it: the session vault, the background-revalidation
//! gate, the post-login prefetches, and the cache wipe on sign-out. A
//! watcher task listens for authorization failures surfaced by fetches
//! and forces the session out when one lands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::{join_all, BoxFuture};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{QueryClient, QueryError, QueryFetcher, QueryKey};

use super::credentials::CredentialStore;
use super::session::{SessionData, SessionVault};

/// Default bound on the startup session restore.
pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { user_id: i64, username: String },
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Remote session service the manager drives.
pub trait AuthBackend: Send + Sync {
    fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> BoxFuture<'static, Result<SessionData, QueryError>>;

    /// Revalidates a persisted session, returning it possibly refreshed.
    fn resume(&self, session: SessionData) -> BoxFuture<'static, Result<SessionData, QueryError>>;

    fn end_session(&self) -> BoxFuture<'static, Result<(), QueryError>>;
}

/// Query warmed right after sign-in, with no subscribers.
pub struct PrefetchQuery {
    pub key: QueryKey,
    pub fetcher: QueryFetcher,
}

pub struct SessionManager {
    client: Arc<QueryClient>,
    backend: Arc<dyn AuthBackend>,
    vault: SessionVault,
    prefetches: Vec<PrefetchQuery>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(
        client: Arc<QueryClient>,
        backend: Arc<dyn AuthBackend>,
        vault: SessionVault,
    ) -> Arc<Self> {
        Self::with_prefetches(client, backend, vault, Vec::new())
    }

    /// Manager that warms `prefetches` after every successful sign-in.
    pub fn with_prefetches(
        client: Arc<QueryClient>,
        backend: Arc<dyn AuthBackend>,
        vault: SessionVault,
        prefetches: Vec<PrefetchQuery>,
    ) -> Arc<Self> {
        client.set_session_gate(false);
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        let manager = Arc::new(SessionManager {
            client,
            backend,
            vault,
            prefetches,
            state,
        });
        manager.spawn_auth_watcher();
        manager
    }

    /// Forces sign-out when any fetch reports an authorization failure.
    /// The task ends with the manager or with the engine.
    fn spawn_auth_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut failures = self.client.auth_failures();
        tokio::spawn(async move {
            while failures.changed().await.is_ok() {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.state.borrow().is_authenticated() {
                    warn!("authorization failure reported by a fetch, signing out");
                    manager.force_logout();
                }
            }
        });
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Authenticates and activates the session: persists it, opens the
    /// background gate, and warms the registered prefetches before
    /// returning. With `remember` the credentials go to the OS keychain
    /// for later restores.
    pub async fn login(
        &self,
        credentials: &Credentials,
        remember: bool,
    ) -> Result<SessionData, QueryError> {
        let session = self.backend.authenticate(credentials).await?;
        info!(username = %session.username, "signed in");
        if remember {
            if let Err(error) = CredentialStore::store(&credentials.username, &credentials.password)
            {
                warn!(error = %error, "credentials not saved to keychain");
            }
        }
        self.activate(&session).await;
        Ok(session)
    }

    /// Ends the session remotely (best effort), then clears the vault,
    /// the cache, and the gate.
    pub async fn logout(&self) {
        if let Err(error) = self.backend.end_session().await {
            debug!(error = %error, "remote sign-out failed");
        }
        self.deactivate();
        info!("signed out");
    }

    /// Bounded-time restore: resume the sealed session if it is still
    /// valid, otherwise re-authenticate with remembered credentials.
    /// Failure or timeout leaves the session unauthenticated.
    pub async fn restore(&self, timeout: Duration) -> SessionState {
        match tokio::time::timeout(timeout, self.try_restore()).await {
            Ok(Some(session)) => {
                info!(username = %session.username, "session restored");
                self.activate(&session).await;
            }
            Ok(None) => debug!("no session to restore"),
            Err(_) => debug!("session restore timed out"),
        }
        self.state.borrow().clone()
    }

    /// Drops remembered credentials from the OS keychain.
    pub fn forget_credentials(username: &str) -> Result<()> {
        CredentialStore::delete(username)
    }

    async fn try_restore(&self) -> Option<SessionData> {
        let persisted = self.vault.open().unwrap_or_else(|error| {
            warn!(error = %error, "session file unreadable");
            None
        });
        let Some(persisted) = persisted else {
            return None;
        };
        let username = persisted.username.clone();
        if !persisted.is_expired() {
            match self.backend.resume(persisted).await {
                Ok(session) => return Some(session),
                Err(error) => debug!(error = %error, "session resume rejected"),
            }
        } else {
            debug!("persisted session expired");
        }

        if !CredentialStore::has_credentials(&username) {
            return None;
        }
        let password = match CredentialStore::get_password(&username) {
            Ok(password) => password,
            Err(error) => {
                debug!(error = %error, "no keychain credentials");
                return None;
            }
        };
        let credentials = Credentials { username, password };
        match self.backend.authenticate(&credentials).await {
            Ok(session) => Some(session),
            Err(error) => {
                debug!(error = %error, "credential re-authentication failed");
                None
            }
        }
    }

    async fn activate(&self, session: &SessionData) {
        if let Err(error) = self.vault.seal(session) {
            warn!(error = %error, "session not persisted");
        }
        self.state.send_replace(SessionState::Authenticated {
            user_id: session.user_id,
            username: session.username.clone(),
        });
        self.client.set_session_gate(true);
        self.run_prefetches().await;
    }

    /// Local sign-out, skipping the remote call. Used when the backend
    /// already rejected our session.
    fn force_logout(&self) {
        self.deactivate();
        info!("signed out after authorization failure");
    }

    fn deactivate(&self) {
        if let Err(error) = self.vault.clear() {
            warn!(error = %error, "session file not removed");
        }
        self.client.set_session_gate(false);
        self.client.clear();
        self.state.send_replace(SessionState::Unauthenticated);
    }

    /// Warms the registered queries with zero subscribers.
    async fn run_prefetches(&self) {
        if self.prefetches.is_empty() {
            return;
        }
        let fetches = self
            .prefetches
            .iter()
            .map(|prefetch| self.client.prefetch(&prefetch.key, prefetch.fetcher.clone()));
        let snapshots = join_all(fetches).await;
        let failed = snapshots.iter().filter(|s| s.is_error()).count();
        debug!(total = snapshots.len(), failed, "login prefetch finished");
    }
}
