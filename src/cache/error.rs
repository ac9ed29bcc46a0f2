//! Engine-level error taxonomy.
//!
//! Fetchers hand the engine a [`QueryError`] rather than a transport error
//! so the coordinator can classify failures without knowing which backend
//! produced them. Transient failures are retried once; authorization
//! failures are reported to the session layer; the rest surface as-is in
//! the query snapshot.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Backend unreachable or temporarily unavailable.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Session rejected by the backend.
    #[error("not authorized")]
    Unauthorized,

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Mutation payload rejected by backend validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Mutation collided with a concurrent edit.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Payload could not be encoded or decoded.
    #[error("bad payload: {0}")]
    Data(String),
}

impl QueryError {
    /// Transient failures get one retry; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, QueryError::Unauthorized)
    }
}
