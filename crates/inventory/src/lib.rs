//! Inventory ownership ledger domain.
//!
//! This crate contains the business rules of the ledger, implemented purely as
//! deterministic domain logic (no IO, no storage, no clocks): the unit model and
//! its ownership state machine, aggregate count derivation, transfer records,
//! snapshots and the allocation algorithm.

pub mod allocation;
pub mod events;
pub mod master;
pub mod progress;
pub mod snapshot;
pub mod transfer;
pub mod unit;

pub use allocation::{AllocationError, AllocationRequest, UnitRef, select_units};
pub use events::LedgerEvent;
pub use master::{AggregateCounts, InventoryMaster, derive_counts};
pub use progress::{FulfilmentStatus, RequestProgress};
pub use snapshot::{ConfigNames, UnitSnapshot};
pub use transfer::{TransferRecord, TransferType};
pub use unit::{
    Identifier, InventoryItem, ItemKey, NewUnit, Owner, OwnerType, Ownership, Provenance,
    PurgedUnit, ReadinessRule, SoftDelete, TransferDecision, UnitSource, UnitState,
};
