use thiserror::Error;

use equiptrack_core::{DomainError, UnitId};
use equiptrack_inventory::{AggregateCounts, AllocationError, ItemKey, Owner};

use crate::store::StoreError;

/// Error returned by every ledger service.
///
/// Carries enough detail for callers to show an actionable message and to
/// decide whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("unit {unit_id} is owned by {actual}, expected {expected}")]
    OwnershipMismatch {
        unit_id: UnitId,
        expected: Owner,
        actual: Owner,
    },

    #[error("insufficient stock for {key}: requested {requested}, available {available}")]
    InsufficientStock {
        key: ItemKey,
        requested: u64,
        available: u64,
    },

    #[error("requested identifiers not available: {}", identifiers.join(", "))]
    IdentifierUnavailable { identifiers: Vec<String> },

    #[error("{resource} is already being processed")]
    AlreadyProcessing { resource: String },

    #[error("deletion of {subject} blocked by {count} user-owned unit(s)")]
    DeletionBlocked {
        subject: String,
        count: usize,
        unit_ids: Vec<UnitId>,
    },

    #[error("aggregate drift for {key}: stored {stored:?}, recomputed {recomputed:?}")]
    DriftDetected {
        key: ItemKey,
        stored: Option<AggregateCounts>,
        recomputed: Option<AggregateCounts>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{operation} exceeded its time budget after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Transient failures an automatic retry may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Timeout { .. } => true,
            LedgerError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Failures the caller may safely retry later (transient or a concurrent run).
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, LedgerError::AlreadyProcessing { .. })
    }

    /// Short message suitable for an end user.
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::OwnershipMismatch { .. } => {
                "This unit has changed hands since the page was loaded.".to_string()
            }
            LedgerError::InsufficientStock {
                requested,
                available,
                ..
            } => format!("Only {available} of {requested} requested units are available."),
            LedgerError::IdentifierUnavailable { identifiers } => format!(
                "These units are not available: {}.",
                identifiers.join(", ")
            ),
            LedgerError::AlreadyProcessing { .. } => {
                "This item is already being processed. Try again shortly.".to_string()
            }
            LedgerError::DeletionBlocked { count, .. } => {
                format!("{count} unit(s) are still held by users and must be returned first.")
            }
            err if err.is_transient() => {
                "The inventory service is busy. Try again shortly.".to_string()
            }
            LedgerError::Store(StoreError::Duplicate(_)) => {
                "This change has already been recorded.".to_string()
            }
            LedgerError::Store(_) => {
                "The inventory records could not be updated. Contact an administrator.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
            DomainError::Validation(msg) | DomainError::InvariantViolation(msg) => {
                LedgerError::Validation(msg)
            }
            invalid @ DomainError::InvalidId { .. } => LedgerError::Validation(invalid.to_string()),
        }
    }
}

impl From<AllocationError> for LedgerError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::InsufficientStock {
                key,
                requested,
                available,
            } => LedgerError::InsufficientStock {
                key,
                requested,
                available,
            },
            AllocationError::IdentifierUnavailable { identifiers } => {
                LedgerError::IdentifierUnavailable { identifiers }
            }
            AllocationError::InvalidRequest(msg) => LedgerError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let busy = LedgerError::AlreadyProcessing {
            resource: "return R1".into(),
        };
        assert!(busy.is_retryable());
        assert!(!busy.is_transient());

        let down = LedgerError::from(StoreError::Unavailable("refused".into()));
        assert!(down.is_transient());

        let invalid = LedgerError::Validation("bad".into());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn only_transient_failures_suggest_retrying() {
        let busy = LedgerError::from(StoreError::Timeout("pool".into()));
        assert!(busy.user_message().contains("Try again"));
        let slow = LedgerError::Timeout {
            operation: "ownership write".into(),
            elapsed_ms: 12,
        };
        assert!(slow.user_message().contains("Try again"));

        for permanent in [
            StoreError::Duplicate("transfer 7".into()),
            StoreError::Rejected("negative count".into()),
            StoreError::Corrupt("bad owner column".into()),
        ] {
            let err = LedgerError::from(permanent);
            assert!(!err.is_transient());
            assert!(!err.user_message().contains("Try again"), "{err}");
        }
    }

    #[test]
    fn domain_errors_map_to_ledger_errors() {
        assert_eq!(
            LedgerError::from(DomainError::conflict("owned by bob")),
            LedgerError::Conflict("owned by bob".into())
        );
        assert!(matches!(
            LedgerError::from(DomainError::invariant("x")),
            LedgerError::Validation(_)
        ));
    }
}
