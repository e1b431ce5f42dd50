//! Remote store abstraction.
//!
//! The remote store is a generic tabular CRUD API. Every call returns either a
//! result or a [`RemoteError`]; the conflict signals (no matching row, stale
//! predicate, duplicate key) are kept apart from transport and validation
//! failures so the sync engine can branch on them directly.

mod memory;
mod rest;

use std::fmt;

use thiserror::Error;

use crate::models::{Row, WriteGuard};

pub use memory::MemoryRemoteStore;
pub use rest::RestRemoteStore;

/// Why the remote refused a write in a way that indicates divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSignal {
    /// The target row does not exist
    NoMatchingRow,
    /// The row exists but no longer matches the write's guard predicate
    StalePredicate,
    /// An insert collided with an existing row
    DuplicateKey,
}

impl fmt::Display for ConflictSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingRow => f.write_str("no matching row"),
            Self::StalePredicate => f.write_str("stale predicate"),
            Self::DuplicateKey => f.write_str("duplicate key"),
        }
    }
}

/// Failure of a single remote call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote conflict: {0}")]
    Conflict(ConflictSignal),
    /// Network failure, timeout or server-side outage; worth retrying
    #[error("remote unavailable: {0}")]
    Transient(String),
    /// The remote understood the request and refused it
    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid remote response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub const fn conflict_signal(&self) -> Option<ConflictSignal> {
        match self {
            Self::Conflict(signal) => Some(*signal),
            _ => None,
        }
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Tabular CRUD operations the sync engine depends on.
///
/// The [`WriteGuard`] on updates and deletes is a predicate on the remote
/// row. A guarded write that matches no row fails with
/// [`ConflictSignal::StalePredicate`].
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// Lightweight reachability probe
    async fn ping(&self) -> RemoteResult<()>;

    /// Every row of `table`, ordered by creation time
    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Row>>;

    async fn select_by_id(&self, table: &str, id: &str) -> RemoteResult<Option<Row>>;

    /// Insert a new row; collides with [`ConflictSignal::DuplicateKey`]
    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row>;

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: &Row,
        guard: &WriteGuard,
    ) -> RemoteResult<Row>;

    async fn delete(
        &self,
        table: &str,
        id: &str,
        guard: &WriteGuard,
    ) -> RemoteResult<()>;

    /// Insert or fully replace a row by id
    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<Row>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_signal_is_distinguished_from_failures() {
        let conflict = RemoteError::Conflict(ConflictSignal::NoMatchingRow);
        assert_eq!(conflict.conflict_signal(), Some(ConflictSignal::NoMatchingRow));
        assert!(!conflict.is_transient());

        let transient = RemoteError::Transient("timeout".to_string());
        assert_eq!(transient.conflict_signal(), None);
        assert!(transient.is_transient());
    }

    #[test]
    fn rejected_error_message_includes_status() {
        let error = RemoteError::Rejected {
            status: 422,
            message: "price must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "remote rejected request (HTTP 422): price must be positive"
        );
    }
}
