//! Domain foundation shared by the ledger crates.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion, INITIAL_VERSION};
pub use error::{DomainError, DomainResult};
pub use id::{CategoryId, ConditionId, StatusId, TransferId, UnitId, UserId};
