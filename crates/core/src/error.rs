//! Ledger domain errors.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic rule violations raised by the domain crates.
///
/// Storage and transport failures are not represented here; the infra crate
/// wraps these together with its own store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A unit or record would leave a state the ledger forbids
    /// (user-owned without a user, purge of an active unit, ...).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid {kind} identifier: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    /// Stale version or duplicate identifier.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidId {
            kind,
            reason: reason.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether the caller supplied bad input, as opposed to hitting a state rule.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidId { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_names_its_kind() {
        let err = DomainError::invalid_id("category", "cannot be empty");
        assert_eq!(err.to_string(), "invalid category identifier: cannot be empty");
        assert!(err.is_input_error());
        assert!(!DomainError::invariant("x").is_input_error());
    }
}
