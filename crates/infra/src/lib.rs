//! Infrastructure layer: storage adapters and the ledger services built on them.
//!
//! Consistency model: there is no multi-entity transaction. Every operation is
//! a short sequence of idempotent, ordered writes (unit, then ledger record,
//! then aggregate), and the reconciliation job heals whatever an interrupted
//! sequence leaves behind.

pub mod aggregate_cache;
pub mod allocation_selector;
pub mod config;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod locks;
pub mod notify;
pub mod reconciliation;
pub mod resolver;
pub mod retry;
pub mod snapshot_service;
pub mod store;
pub mod transfer_service;
pub mod workflow;

pub use aggregate_cache::{AggregateCache, AggregateReading, AggregateSnapshot};
pub use allocation_selector::AllocationSelector;
pub use config::{ConfigError, LedgerConfig};
pub use error::LedgerError;
pub use intake::{DeletionScope, IntakeOutcome, ItemTypeDeletion, UnitIntake};
pub use ledger::{Ledger, LedgerStores};
pub use locks::{InMemoryLockProvider, LeaseGuard, LeaseToken, LockProvider, WorkflowLocks};
pub use notify::{LedgerEnvelope, Notifier};
pub use reconciliation::{
    DeletionEligibility, KeyReport, PurgeReport, PurgedEntry, ReconciliationJob,
    ReconciliationReport, RunMode, Scope, SkippedUnit,
};
pub use resolver::{ConfigResolver, InMemoryConfigResolver, NameQuery};
pub use retry::{BackoffStrategy, RetryPolicy, retry_transient};
pub use snapshot_service::SnapshotService;
pub use store::StoreError;
pub use transfer_service::{
    OwnershipTransferService, TransferOutcome, TransferRequest, TransferResult,
};
pub use workflow::{
    FulfilRequest, Fulfilment, LedgerWorkflows, ReturnApproval, UnitOutcome, UnitStatus,
    ensure_cancellable,
};
