//! Authentication module for the session lifecycle and credentials.
//!
//! This module provides:
//! - `SessionManager`: login, logout, bounded restore, forced sign-out
//! - `SessionVault`: encrypted on-disk session persistence
//! - `CredentialStore`: secure OS-level credential storage via keyring
//!
//! Sessions are sealed to disk and expire after a full workday. While no
//! session is active, background revalidation stays gated off.

pub mod credentials;
pub mod lifecycle;
pub mod session;

pub use credentials::CredentialStore;
pub use lifecycle::{
    AuthBackend, Credentials, PrefetchQuery, SessionManager, SessionState,
    DEFAULT_RESTORE_TIMEOUT,
};
pub use session::{SessionData, SessionVault};
