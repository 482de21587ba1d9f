//! Ownership Transfer Service: the only path that changes who holds a unit.
//!
//! One transfer is three steps, in order:
//!
//! 1. compare-and-set the unit's ownership (expected current owner = `from`)
//! 2. append the Transfer Record
//! 3. recompute the aggregate for the unit's item key
//!
//! If step 2 fails the ownership write is rolled back. A retry of a transfer
//! whose ownership write survived a crash finds the unit already held by `to`
//! and appends the missing record (flagged `recovered`) instead of moving it
//! again.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use equiptrack_core::{AggregateRoot, ExpectedVersion, UnitId};
use equiptrack_inventory::{
    InventoryItem, LedgerEvent, Owner, TransferDecision, TransferRecord, TransferType,
};

use crate::aggregate_cache::{AggregateCache, AggregateSnapshot};
use crate::error::LedgerError;
use crate::notify::Notifier;
use crate::store::{StoreError, TransferLedger, UnitStore};

const UNIT_STRIPES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub unit_id: UnitId,
    /// Owner the caller believes currently holds the unit.
    pub from: Owner,
    pub to: Owner,
    pub transfer_type: TransferType,
    pub processed_by: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Applied,
    /// The ledger already shows this transfer; nothing moved.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub outcome: TransferOutcome,
    pub unit: InventoryItem,
    /// Record appended by this call: the new record, a repaired one, or none.
    pub record: Option<TransferRecord>,
    pub aggregate: AggregateSnapshot,
}

struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn check(&self, operation: &str) -> Result<(), LedgerError> {
        let elapsed = self.started.elapsed();
        if elapsed > self.budget {
            return Err(LedgerError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        Ok(())
    }
}

pub struct OwnershipTransferService {
    units: Arc<dyn UnitStore>,
    ledger: Arc<dyn TransferLedger>,
    cache: Arc<AggregateCache>,
    notifier: Notifier,
    timeout: Duration,
    // In-process serialization per unit; cross-process callers hold workflow leases.
    stripes: Vec<Mutex<()>>,
}

impl OwnershipTransferService {
    pub fn new(
        units: Arc<dyn UnitStore>,
        ledger: Arc<dyn TransferLedger>,
        cache: Arc<AggregateCache>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self {
            units,
            ledger,
            cache,
            notifier,
            timeout,
            stripes: (0..UNIT_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Move one unit from `from` to `to`.
    ///
    /// Idempotent: repeating a completed transfer returns `AlreadyApplied`
    /// without a second ownership write or a duplicate record.
    #[instrument(
        skip(self, request),
        fields(
            unit_id = %request.unit_id,
            transfer_type = request.transfer_type.as_str(),
            processed_by = %request.processed_by
        )
    )]
    pub fn transfer(&self, request: TransferRequest) -> Result<TransferResult, LedgerError> {
        validate(&request)?;
        let deadline = Deadline::start(self.timeout);

        let stripe = &self.stripes[stripe_of(request.unit_id)];
        let _serial = stripe.lock().map_err(|_| StoreError::poisoned())?;

        let unit = self.load(request.unit_id)?;
        match unit.check_transfer(&request.from, &request.to) {
            TransferDecision::Apply => self.apply(unit, &request, &deadline),
            decision => self.settle(unit, decision, &request, &deadline),
        }
    }

    /// Full ledger history of one unit, oldest first.
    pub fn history(&self, unit_id: UnitId) -> Result<Vec<TransferRecord>, LedgerError> {
        Ok(self.ledger.history_for_unit(unit_id)?)
    }

    pub fn latest(&self, unit_id: UnitId) -> Result<Option<TransferRecord>, LedgerError> {
        Ok(self.ledger.latest_for_unit(unit_id)?)
    }

    /// Records appended for one workflow item, identified by its reason text.
    pub fn recorded_for(&self, reason: &str) -> Result<Vec<TransferRecord>, LedgerError> {
        Ok(self.ledger.recorded_with_reason(reason)?)
    }

    fn load(&self, unit_id: UnitId) -> Result<InventoryItem, LedgerError> {
        self.units
            .get(unit_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("unit {unit_id}")))
    }

    fn settle(
        &self,
        unit: InventoryItem,
        decision: TransferDecision,
        request: &TransferRequest,
        deadline: &Deadline,
    ) -> Result<TransferResult, LedgerError> {
        match decision {
            TransferDecision::AlreadyApplied => self.replay(unit, request, deadline),
            TransferDecision::Mismatch { actual } => Err(LedgerError::OwnershipMismatch {
                unit_id: request.unit_id,
                expected: request.from.clone(),
                actual,
            }),
            TransferDecision::Deleted => Err(LedgerError::Validation(format!(
                "unit {} is soft-deleted and cannot change hands",
                request.unit_id
            ))),
            TransferDecision::Apply => Err(LedgerError::Conflict(format!(
                "unit {} changed during the transfer",
                request.unit_id
            ))),
        }
    }

    fn apply(
        &self,
        unit: InventoryItem,
        request: &TransferRequest,
        deadline: &Deadline,
    ) -> Result<TransferResult, LedgerError> {
        deadline.check("ownership write")?;
        let now = Utc::now();
        let mut moved = unit.clone();
        moved.reassign(&request.from, request.to.clone(), now)?;

        let written = match self
            .units
            .update(moved, ExpectedVersion::Exact(unit.version()))
        {
            Ok(written) => written,
            Err(err) if err.is_retryable() => {
                // The write may have landed anyway; decide from the current row.
                let current = self.load(request.unit_id)?;
                let decision = current.check_transfer(&request.from, &request.to);
                if decision == TransferDecision::Apply {
                    return Err(err.into());
                }
                return self.settle(current, decision, request, deadline);
            }
            Err(err) => return Err(err.into()),
        };

        let record = TransferRecord::ownership_change(
            &written,
            request.transfer_type,
            request.from.clone(),
            request.to.clone(),
            request.processed_by.as_str(),
            request.reason.as_str(),
            now,
        )?;
        if let Err(err) = self.append(&record, deadline) {
            self.roll_back(&unit, &written);
            return Err(err);
        }
        info!(
            transfer_id = %record.id,
            item_type = written.item_type(),
            category_id = %written.category_id(),
            from = %request.from,
            to = %request.to,
            "ownership transferred"
        );

        let aggregate = self.cache.recompute(written.key())?;
        self.notifier.publish(LedgerEvent::TransferRecorded {
            record: record.clone(),
        });
        Ok(TransferResult {
            outcome: TransferOutcome::Applied,
            unit: written,
            record: Some(record),
            aggregate,
        })
    }

    fn append(&self, record: &TransferRecord, deadline: &Deadline) -> Result<(), LedgerError> {
        deadline.check("transfer record append")?;
        match self.ledger.append(record.clone()) {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                // An unacknowledged append may still have been written.
                let landed = self
                    .ledger
                    .latest_for_unit(record.unit_id)
                    .ok()
                    .flatten()
                    .is_some_and(|latest| latest.id == record.id);
                if landed { Ok(()) } else { Err(err.into()) }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn roll_back(&self, original: &InventoryItem, written: &InventoryItem) {
        match self
            .units
            .update(original.clone(), ExpectedVersion::Exact(written.version()))
        {
            Ok(_) => warn!(
                unit_id = %original.id_typed(),
                "transfer record not written; ownership change rolled back"
            ),
            Err(err) => error!(
                unit_id = %original.id_typed(),
                error = %err,
                "rollback failed; retrying the same transfer repairs the missing record"
            ),
        }
    }

    /// The unit already sits with `to`. It is a replay only when the ledger
    /// shows it arriving from `from`; a missing record is repaired.
    fn replay(
        &self,
        unit: InventoryItem,
        request: &TransferRequest,
        deadline: &Deadline,
    ) -> Result<TransferResult, LedgerError> {
        let latest = self.ledger.latest_for_unit(unit.id_typed())?;
        let mismatch = || LedgerError::OwnershipMismatch {
            unit_id: request.unit_id,
            expected: request.from.clone(),
            actual: unit.owner().clone(),
        };

        let repaired = match &latest {
            Some(record) if record.lands_on(unit.owner()) => {
                if record.from != request.from {
                    return Err(mismatch());
                }
                None
            }
            // Provenance explains the owner; `from` never held the unit.
            None if &unit.provenance().initial_owner == unit.owner() => {
                return Err(mismatch());
            }
            _ => {
                let previous = latest
                    .as_ref()
                    .and_then(|r| r.to.clone())
                    .unwrap_or_else(|| unit.provenance().initial_owner.clone());
                if previous != request.from {
                    warn!(
                        owner = %unit.owner(),
                        expected = %request.from,
                        "current ownership is not explained by the ledger; left for reconciliation"
                    );
                    return Err(mismatch());
                }
                let record = TransferRecord::ownership_change(
                    &unit,
                    request.transfer_type,
                    request.from.clone(),
                    request.to.clone(),
                    request.processed_by.as_str(),
                    request.reason.as_str(),
                    unit.ownership().owned_since(),
                )?
                .mark_recovered();
                self.append(&record, deadline)?;
                warn!(
                    transfer_id = %record.id,
                    "ownership change had no transfer record; appended recovered record"
                );
                Some(record)
            }
        };

        let aggregate = self.cache.recompute(unit.key())?;
        if let Some(record) = &repaired {
            self.notifier.publish(LedgerEvent::TransferRecorded {
                record: record.clone(),
            });
        }
        Ok(TransferResult {
            outcome: TransferOutcome::AlreadyApplied,
            unit,
            record: repaired,
            aggregate,
        })
    }
}

fn validate(request: &TransferRequest) -> Result<(), LedgerError> {
    if request.processed_by.trim().is_empty() {
        return Err(LedgerError::Validation("processed_by cannot be empty".into()));
    }
    if request.transfer_type == TransferType::BulkAdminRemoval {
        return Err(LedgerError::Validation(
            "bulk removal is performed by reconciliation, not by transfer".into(),
        ));
    }
    if request.from == request.to {
        return Err(LedgerError::Validation(format!(
            "unit {} cannot be transferred to its current owner",
            request.unit_id
        )));
    }
    Ok(())
}

fn stripe_of(unit_id: UnitId) -> usize {
    let mut hasher = DefaultHasher::new();
    unit_id.hash(&mut hasher);
    (hasher.finish() as usize) % UNIT_STRIPES
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;
    use equiptrack_core::{CategoryId, ConditionId, StatusId, UserId};
    use equiptrack_inventory::{ItemKey, NewUnit, ReadinessRule};

    use crate::store::{InMemoryAggregateStore, InMemoryTransferLedger, InMemoryUnitStore};

    /// Ledger whose next `failures` appends fail with `Unavailable`.
    struct FlakyLedger {
        inner: InMemoryTransferLedger,
        failures: AtomicUsize,
    }

    impl TransferLedger for FlakyLedger {
        fn append(&self, record: TransferRecord) -> Result<(), StoreError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.append(record)
        }

        fn history_for_unit(&self, unit_id: UnitId) -> Result<Vec<TransferRecord>, StoreError> {
            self.inner.history_for_unit(unit_id)
        }

        fn recorded_with_reason(&self, reason: &str) -> Result<Vec<TransferRecord>, StoreError> {
            self.inner.recorded_with_reason(reason)
        }

        fn recorded_before(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<TransferRecord>, StoreError> {
            self.inner.recorded_before(cutoff, limit)
        }

        fn count(&self) -> Result<u64, StoreError> {
            self.inner.count()
        }
    }

    struct Fixture {
        units: Arc<InMemoryUnitStore>,
        ledger: Arc<FlakyLedger>,
        service: OwnershipTransferService,
    }

    /// Unit store whose reads take `delay`.
    struct SlowUnitStore {
        inner: Arc<InMemoryUnitStore>,
        delay: Duration,
    }

    impl UnitStore for SlowUnitStore {
        fn get(&self, id: UnitId) -> Result<Option<InventoryItem>, StoreError> {
            std::thread::sleep(self.delay);
            self.inner.get(id)
        }

        fn get_many(&self, ids: &[UnitId]) -> Result<Vec<InventoryItem>, StoreError> {
            self.inner.get_many(ids)
        }

        fn insert(&self, unit: InventoryItem) -> Result<InventoryItem, StoreError> {
            self.inner.insert(unit)
        }

        fn update(
            &self,
            unit: InventoryItem,
            expected: ExpectedVersion,
        ) -> Result<InventoryItem, StoreError> {
            self.inner.update(unit, expected)
        }

        fn list_by_key(&self, key: &ItemKey) -> Result<Vec<InventoryItem>, StoreError> {
            self.inner.list_by_key(key)
        }

        fn keys(&self) -> Result<Vec<ItemKey>, StoreError> {
            self.inner.keys()
        }

        fn delete_purged(&self, id: UnitId, expected: ExpectedVersion) -> Result<(), StoreError> {
            self.inner.delete_purged(id, expected)
        }
    }

    fn service_over(
        units: Arc<dyn UnitStore>,
        ledger: Arc<dyn TransferLedger>,
        timeout: Duration,
    ) -> OwnershipTransferService {
        let cache = Arc::new(AggregateCache::new(
            units.clone(),
            Arc::new(InMemoryAggregateStore::new()),
            ReadinessRule::new(
                StatusId::parse("available").unwrap(),
                ConditionId::parse("working").unwrap(),
            ),
            Notifier::disabled(),
        ));
        OwnershipTransferService::new(units, ledger, cache, Notifier::disabled(), timeout)
    }

    fn fixture(append_failures: usize) -> Fixture {
        let units = Arc::new(InMemoryUnitStore::new());
        let ledger = Arc::new(FlakyLedger {
            inner: InMemoryTransferLedger::new(),
            failures: AtomicUsize::new(append_failures),
        });
        let service = service_over(units.clone(), ledger.clone(), Duration::from_secs(5));
        Fixture {
            units,
            ledger,
            service,
        }
    }

    fn stock(units: &InMemoryUnitStore) -> InventoryItem {
        let unit = InventoryItem::admin_intake(
            UnitId::new(),
            NewUnit {
                key: ItemKey::new("Dell01", CategoryId::parse("laptops").unwrap()).unwrap(),
                identifier: None,
                status_id: StatusId::parse("available").unwrap(),
                condition_id: ConditionId::parse("working").unwrap(),
            },
            "admin",
            Utc::now(),
        )
        .unwrap();
        units.insert(unit).unwrap()
    }

    fn alice() -> Owner {
        Owner::user(UserId::parse("alice").unwrap())
    }

    fn issue(unit_id: UnitId) -> TransferRequest {
        TransferRequest {
            unit_id,
            from: Owner::AdminStock,
            to: alice(),
            transfer_type: TransferType::RequestApproved,
            processed_by: "admin-1".into(),
            reason: "request approved".into(),
        }
    }

    #[test]
    fn transfer_moves_unit_records_and_recomputes() {
        let fx = fixture(0);
        let unit = stock(&fx.units);

        let result = fx.service.transfer(issue(unit.id_typed())).unwrap();
        assert_eq!(result.outcome, TransferOutcome::Applied);
        assert_eq!(result.unit.owner(), &alice());
        assert_eq!(result.aggregate.counts().user_owned_quantity, 1);
        assert_eq!(result.aggregate.counts().available_quantity, 0);
        assert_eq!(fx.ledger.count().unwrap(), 1);
    }

    #[test]
    fn repeating_a_transfer_is_a_no_op() {
        let fx = fixture(0);
        let unit = stock(&fx.units);
        fx.service.transfer(issue(unit.id_typed())).unwrap();

        let again = fx.service.transfer(issue(unit.id_typed())).unwrap();
        assert_eq!(again.outcome, TransferOutcome::AlreadyApplied);
        assert_eq!(again.record, None);
        assert_eq!(again.unit.version(), 2);
        assert_eq!(fx.ledger.count().unwrap(), 1);
    }

    #[test]
    fn wrong_expected_owner_is_rejected() {
        let fx = fixture(0);
        let unit = stock(&fx.units);
        let mut request = issue(unit.id_typed());
        request.from = Owner::user(UserId::parse("bob").unwrap());

        let err = fx.service.transfer(request).unwrap_err();
        assert_eq!(
            err,
            LedgerError::OwnershipMismatch {
                unit_id: unit.id_typed(),
                expected: Owner::user(UserId::parse("bob").unwrap()),
                actual: Owner::AdminStock,
            }
        );
        assert_eq!(fx.ledger.count().unwrap(), 0);
    }

    #[test]
    fn failed_append_rolls_ownership_back() {
        let fx = fixture(1);
        let unit = stock(&fx.units);

        let err = fx.service.transfer(issue(unit.id_typed())).unwrap_err();
        assert!(err.is_transient());

        let current = fx.units.get(unit.id_typed()).unwrap().unwrap();
        assert_eq!(current.owner(), &Owner::AdminStock);
        assert_eq!(fx.ledger.count().unwrap(), 0);

        let retried = fx.service.transfer(issue(unit.id_typed())).unwrap();
        assert_eq!(retried.outcome, TransferOutcome::Applied);
        assert_eq!(fx.ledger.count().unwrap(), 1);
    }

    #[test]
    fn retry_after_crash_appends_the_missing_record() {
        let fx = fixture(0);
        let mut unit = stock(&fx.units);
        // Ownership write committed, process died before the append.
        unit.reassign(&Owner::AdminStock, alice(), Utc::now()).unwrap();
        fx.units.update(unit.clone(), ExpectedVersion::Exact(1)).unwrap();

        let result = fx.service.transfer(issue(unit.id_typed())).unwrap();
        assert_eq!(result.outcome, TransferOutcome::AlreadyApplied);
        let record = result.record.unwrap();
        assert!(record.recovered);
        assert!(record.lands_on(&alice()));

        let again = fx.service.transfer(issue(unit.id_typed())).unwrap();
        assert_eq!(again.record, None);
        assert_eq!(fx.ledger.count().unwrap(), 1);
    }

    fn return_from(user: Owner, unit_id: UnitId) -> TransferRequest {
        TransferRequest {
            unit_id,
            from: user,
            to: Owner::AdminStock,
            transfer_type: TransferType::ReturnCompleted,
            processed_by: "admin-1".into(),
            reason: "returned".into(),
        }
    }

    #[test]
    fn return_of_a_unit_the_user_never_held_is_a_mismatch() {
        let fx = fixture(0);
        let unit = stock(&fx.units);

        let err = fx
            .service
            .transfer(return_from(alice(), unit.id_typed()))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::OwnershipMismatch {
                unit_id: unit.id_typed(),
                expected: alice(),
                actual: Owner::AdminStock,
            }
        );
        assert_eq!(fx.ledger.count().unwrap(), 0);
    }

    #[test]
    fn replay_must_match_the_recorded_sender() {
        let fx = fixture(0);
        let unit = stock(&fx.units);
        fx.service.transfer(issue(unit.id_typed())).unwrap();
        fx.service
            .transfer(return_from(alice(), unit.id_typed()))
            .unwrap();

        let bob = Owner::user(UserId::parse("bob").unwrap());
        let err = fx
            .service
            .transfer(return_from(bob, unit.id_typed()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::OwnershipMismatch { .. }));

        let replay = fx
            .service
            .transfer(return_from(alice(), unit.id_typed()))
            .unwrap();
        assert_eq!(replay.outcome, TransferOutcome::AlreadyApplied);
        assert_eq!(fx.ledger.count().unwrap(), 2);
    }

    #[test]
    fn unexplained_owner_is_not_repaired_for_another_sender() {
        let fx = fixture(0);
        let mut unit = stock(&fx.units);
        // Ownership moved outside the service with no record.
        unit.reassign(&Owner::AdminStock, alice(), Utc::now()).unwrap();
        fx.units.update(unit.clone(), ExpectedVersion::Exact(1)).unwrap();

        let mut request = issue(unit.id_typed());
        request.from = Owner::user(UserId::parse("bob").unwrap());
        let err = fx.service.transfer(request).unwrap_err();
        assert!(matches!(err, LedgerError::OwnershipMismatch { .. }));
        assert_eq!(fx.ledger.count().unwrap(), 0);
    }

    #[test]
    fn slow_store_times_out_before_the_ownership_write() {
        let units = Arc::new(InMemoryUnitStore::new());
        let ledger = Arc::new(InMemoryTransferLedger::new());
        let slow = Arc::new(SlowUnitStore {
            inner: units.clone(),
            delay: Duration::from_millis(50),
        });
        let service = service_over(slow, ledger.clone(), Duration::from_millis(10));
        let unit = stock(&units);

        let err = service.transfer(issue(unit.id_typed())).unwrap_err();
        match &err {
            LedgerError::Timeout {
                operation,
                elapsed_ms,
            } => {
                assert_eq!(operation, "ownership write");
                assert!(*elapsed_ms >= 10);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(err.is_transient());

        let current = units.get(unit.id_typed()).unwrap().unwrap();
        assert_eq!(current.owner(), &Owner::AdminStock);
        assert_eq!(current.version(), 1);
        assert_eq!(ledger.count().unwrap(), 0);
    }

    #[test]
    fn soft_deleted_units_cannot_move() {
        let fx = fixture(0);
        let mut unit = stock(&fx.units);
        unit.soft_delete("retired", "admin", Utc::now()).unwrap();
        fx.units.update(unit.clone(), ExpectedVersion::Exact(1)).unwrap();

        let err = fx.service.transfer(issue(unit.id_typed())).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn malformed_requests_are_rejected_before_any_read() {
        let fx = fixture(0);
        let mut request = issue(UnitId::new());
        request.processed_by = " ".into();
        assert!(matches!(
            fx.service.transfer(request),
            Err(LedgerError::Validation(_))
        ));

        let mut removal = issue(UnitId::new());
        removal.transfer_type = TransferType::BulkAdminRemoval;
        assert!(matches!(
            fx.service.transfer(removal),
            Err(LedgerError::Validation(_))
        ));

        assert!(matches!(
            fx.service.transfer(issue(UnitId::new())),
            Err(LedgerError::NotFound(_))
        ));
    }
}
