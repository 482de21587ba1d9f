//! Fulfilment helpers called by the request/return workflow engine.
//!
//! Each helper holds a lease on the workflow item for its whole run, so a
//! double-clicked approval yields `AlreadyProcessing` instead of a second pass.
//! Units are transferred one at a time; a failure on one unit does not undo
//! the others, it is reported as a partial fulfilment.

use std::sync::Arc;

use tracing::{info, warn};

use equiptrack_core::{UnitId, UserId};
use equiptrack_inventory::{ItemKey, Owner, RequestProgress, TransferType, UnitSnapshot};

use crate::allocation_selector::AllocationSelector;
use crate::error::LedgerError;
use crate::locks::WorkflowLocks;
use crate::retry::{RetryPolicy, retry_transient};
use crate::snapshot_service::SnapshotService;
use crate::transfer_service::{OwnershipTransferService, TransferOutcome, TransferRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfilRequest {
    pub request_id: String,
    pub user: UserId,
    pub key: ItemKey,
    pub quantity: u64,
    /// Serial/phone numbers the user asked for by name.
    pub identifiers: Vec<String>,
    pub processed_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnApproval {
    pub return_id: String,
    pub user: UserId,
    pub unit_ids: Vec<UnitId>,
    pub processed_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Transferred,
    /// An earlier attempt had already moved the unit.
    AlreadyTransferred,
    Failed(LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub unit_id: UnitId,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfilment {
    pub reference: String,
    pub progress: RequestProgress,
    pub outcomes: Vec<UnitOutcome>,
    /// Frozen identity of every unit that reached its new owner.
    pub snapshots: Vec<UnitSnapshot>,
}

impl Fulfilment {
    pub fn failures(&self) -> impl Iterator<Item = (&UnitId, &LedgerError)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            UnitStatus::Failed(err) => Some((&o.unit_id, err)),
            _ => None,
        })
    }
}

pub struct LedgerWorkflows {
    selector: Arc<AllocationSelector>,
    transfers: Arc<OwnershipTransferService>,
    snapshots: Arc<SnapshotService>,
    locks: WorkflowLocks,
    retry: RetryPolicy,
}

impl LedgerWorkflows {
    pub fn new(
        selector: Arc<AllocationSelector>,
        transfers: Arc<OwnershipTransferService>,
        snapshots: Arc<SnapshotService>,
        locks: WorkflowLocks,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            selector,
            transfers,
            snapshots,
            locks,
            retry,
        }
    }

    /// Approve a request: select units, move each to the user, snapshot them.
    ///
    /// Re-running the same request id picks up the units an earlier pass
    /// already moved and selects only the remainder.
    pub fn fulfil_request(&self, request: FulfilRequest) -> Result<Fulfilment, LedgerError> {
        let reference = format!("request:{}", request.request_id);
        let _lease = self.locks.acquire(reference.clone())?;
        let reason = format!("request {} approved", request.request_id);
        let to = Owner::user(request.user.clone());

        let mut unit_ids: Vec<UnitId> = Vec::new();
        let mut claimed = Vec::new();
        for record in self.transfers.recorded_for(&reason)? {
            let earlier = record.transfer_type == TransferType::RequestApproved
                && record.lands_on(&to)
                && !unit_ids.contains(&record.unit_id);
            if earlier {
                unit_ids.push(record.unit_id);
                claimed.extend(record.identifier);
            }
        }

        unit_ids.truncate(usize::try_from(request.quantity).unwrap_or(usize::MAX));
        let outstanding = request.quantity.saturating_sub(unit_ids.len() as u64);
        if outstanding > 0 || unit_ids.is_empty() {
            let named: Vec<String> = request
                .identifiers
                .iter()
                .filter(|name| !claimed.iter().any(|id| id.matches(name)))
                .cloned()
                .collect();
            let picked = self
                .selector
                .select_units(&request.key, outstanding, &named)?;
            unit_ids.extend(picked.iter().map(|r| r.unit_id));
        } else {
            info!(
                reference = %reference,
                moved = unit_ids.len(),
                "request already fulfilled; replaying"
            );
        }

        self.run(
            reference,
            request.quantity,
            &unit_ids,
            |unit_id| TransferRequest {
                unit_id,
                from: Owner::AdminStock,
                to: to.clone(),
                transfer_type: TransferType::RequestApproved,
                processed_by: request.processed_by.clone(),
                reason: reason.clone(),
            },
        )
    }

    /// Accept a return: move each unit from the user back to admin stock.
    pub fn approve_return(&self, approval: ReturnApproval) -> Result<Fulfilment, LedgerError> {
        if approval.unit_ids.is_empty() {
            return Err(LedgerError::Validation("a return needs at least one unit".into()));
        }
        let reference = format!("return:{}", approval.return_id);
        let _lease = self.locks.acquire(reference.clone())?;
        let reason = format!("return {} completed", approval.return_id);

        self.run(
            reference,
            approval.unit_ids.len() as u64,
            &approval.unit_ids,
            |unit_id| TransferRequest {
                unit_id,
                from: Owner::user(approval.user.clone()),
                to: Owner::AdminStock,
                transfer_type: TransferType::ReturnCompleted,
                processed_by: approval.processed_by.clone(),
                reason: reason.clone(),
            },
        )
    }

    fn run(
        &self,
        reference: String,
        requested: u64,
        unit_ids: &[UnitId],
        build: impl Fn(UnitId) -> TransferRequest,
    ) -> Result<Fulfilment, LedgerError> {
        // Identity is frozen before anything moves.
        let captured = self.snapshots.snapshot(unit_ids)?;

        let mut progress = RequestProgress::new(requested);
        let mut outcomes = Vec::with_capacity(unit_ids.len());
        let mut snapshots = Vec::new();
        for (unit_id, snapshot) in unit_ids.iter().zip(captured) {
            let transfer = build(*unit_id);
            let status = match retry_transient(&self.retry, "unit transfer", || {
                self.transfers.transfer(transfer.clone())
            }) {
                Ok(result) => {
                    progress.record_success();
                    snapshots.push(snapshot);
                    match result.outcome {
                        TransferOutcome::Applied => UnitStatus::Transferred,
                        TransferOutcome::AlreadyApplied => UnitStatus::AlreadyTransferred,
                    }
                }
                Err(err) => {
                    warn!(reference = %reference, unit_id = %unit_id, error = %err, "unit transfer failed");
                    progress.record_failure();
                    UnitStatus::Failed(err)
                }
            };
            outcomes.push(UnitOutcome {
                unit_id: *unit_id,
                status,
            });
        }

        info!(
            reference = %reference,
            requested,
            transferred = progress.transferred,
            failed = progress.failed,
            status = ?progress.status(),
            "workflow item processed"
        );
        Ok(Fulfilment {
            reference,
            progress,
            outcomes,
            snapshots,
        })
    }
}

/// Cancellation is only possible while no unit has been transferred.
pub fn ensure_cancellable(progress: &RequestProgress) -> Result<(), LedgerError> {
    if progress.can_cancel() {
        return Ok(());
    }
    Err(LedgerError::Validation(format!(
        "{} unit(s) already transferred; return them instead of cancelling",
        progress.transferred
    )))
}
