//! Wiring of the ledger services over one set of stores.

use std::sync::Arc;

use equiptrack_events::EventBus;

use crate::aggregate_cache::AggregateCache;
use crate::allocation_selector::AllocationSelector;
use crate::config::{ConfigError, LedgerConfig};
use crate::intake::UnitIntake;
use crate::locks::{InMemoryLockProvider, LockProvider, WorkflowLocks};
use crate::notify::{LedgerEnvelope, Notifier};
use crate::reconciliation::ReconciliationJob;
use crate::resolver::{ConfigResolver, InMemoryConfigResolver};
use crate::snapshot_service::SnapshotService;
use crate::store::{
    AggregateStore, InMemoryAggregateStore, InMemoryTransferLedger, InMemoryUnitStore,
    TransferLedger, UnitStore,
};
use crate::transfer_service::OwnershipTransferService;
use crate::workflow::LedgerWorkflows;

/// Storage ports the services run on.
#[derive(Clone)]
pub struct LedgerStores {
    pub units: Arc<dyn UnitStore>,
    pub masters: Arc<dyn AggregateStore>,
    pub transfers: Arc<dyn TransferLedger>,
    pub resolver: Arc<dyn ConfigResolver>,
    pub locks: Arc<dyn LockProvider>,
}

impl LedgerStores {
    pub fn in_memory(resolver: Arc<InMemoryConfigResolver>) -> Self {
        Self {
            units: Arc::new(InMemoryUnitStore::new()),
            masters: Arc::new(InMemoryAggregateStore::new()),
            transfers: Arc::new(InMemoryTransferLedger::new()),
            resolver,
            locks: Arc::new(InMemoryLockProvider::new()),
        }
    }

    /// Every port served by one Postgres store.
    #[cfg(feature = "postgres")]
    pub fn postgres(store: crate::store::postgres::PostgresLedgerStore) -> Self {
        let store = Arc::new(store);
        Self {
            units: store.clone(),
            masters: store.clone(),
            transfers: store.clone(),
            resolver: store.clone(),
            locks: store,
        }
    }
}

pub struct Ledger {
    config: LedgerConfig,
    stores: LedgerStores,
    locks: WorkflowLocks,
    cache: Arc<AggregateCache>,
    transfers: Arc<OwnershipTransferService>,
    selector: Arc<AllocationSelector>,
    snapshots: Arc<SnapshotService>,
    reconciliation: Arc<ReconciliationJob>,
    intake: UnitIntake,
    workflows: LedgerWorkflows,
}

impl Ledger {
    pub fn new(
        config: LedgerConfig,
        stores: LedgerStores,
        bus: Option<Arc<dyn EventBus<LedgerEnvelope>>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rule = config.readiness_rule()?;
        let notifier = bus.map(Notifier::new).unwrap_or_default();
        let locks = WorkflowLocks::new(Arc::clone(&stores.locks), config.lock_lease);

        let cache = Arc::new(AggregateCache::new(
            Arc::clone(&stores.units),
            Arc::clone(&stores.masters),
            rule,
            notifier.clone(),
        ));
        let transfers = Arc::new(OwnershipTransferService::new(
            Arc::clone(&stores.units),
            Arc::clone(&stores.transfers),
            Arc::clone(&cache),
            notifier.clone(),
            config.operation_timeout,
        ));
        let selector = Arc::new(AllocationSelector::new(
            Arc::clone(&stores.units),
            Arc::clone(&cache),
        ));
        let snapshots = Arc::new(SnapshotService::new(
            Arc::clone(&stores.units),
            Arc::clone(&stores.resolver),
            config.unknown_label.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationJob::new(
            Arc::clone(&stores.units),
            Arc::clone(&stores.transfers),
            Arc::clone(&cache),
            locks.clone(),
            notifier,
        ));
        let intake = UnitIntake::new(
            Arc::clone(&stores.units),
            Arc::clone(&cache),
            Arc::clone(&reconciliation),
        );
        let workflows = LedgerWorkflows::new(
            Arc::clone(&selector),
            Arc::clone(&transfers),
            Arc::clone(&snapshots),
            locks.clone(),
            config.retry.clone(),
        );

        Ok(Self {
            config,
            stores,
            locks,
            cache,
            transfers,
            selector,
            snapshots,
            reconciliation,
            intake,
            workflows,
        })
    }

    /// Fully in-memory ledger for tests and local development.
    pub fn in_memory(
        config: LedgerConfig,
        resolver: Arc<InMemoryConfigResolver>,
    ) -> Result<Self, ConfigError> {
        Self::new(config, LedgerStores::in_memory(resolver), None)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn stores(&self) -> &LedgerStores {
        &self.stores
    }

    pub fn locks(&self) -> &WorkflowLocks {
        &self.locks
    }

    pub fn aggregates(&self) -> &AggregateCache {
        &self.cache
    }

    pub fn transfers(&self) -> &OwnershipTransferService {
        &self.transfers
    }

    pub fn selector(&self) -> &AllocationSelector {
        &self.selector
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn reconciliation(&self) -> &ReconciliationJob {
        &self.reconciliation
    }

    pub fn intake(&self) -> &UnitIntake {
        &self.intake
    }

    pub fn workflows(&self) -> &LedgerWorkflows {
        &self.workflows
    }
}
