//! Persistence ports for the ledger and their in-memory adapters.
//!
//! Every store is synchronous and `Send + Sync`; services hold them as
//! `Arc<dyn ...>` so the in-memory and Postgres adapters are interchangeable.

mod masters;
mod transfers;
mod units;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use masters::{AggregateStore, InMemoryAggregateStore};
pub use transfers::{InMemoryTransferLedger, TransferLedger};
pub use units::{InMemoryUnitStore, UnitStore};

use thiserror::Error;

/// Storage-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend could not be reached (connection refused, pool closed).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// A compare-and-set write lost against a concurrent writer.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// The write would break a storage-level rule.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// Persisted data could not be decoded into a valid record.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::VersionConflict(_)
        )
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Corrupt("lock poisoned".to_string())
    }
}
