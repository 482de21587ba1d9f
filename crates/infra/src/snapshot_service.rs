//! Snapshot Service: freezes unit identity for embedding in request/return items.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use equiptrack_core::UnitId;
use equiptrack_inventory::{ConfigNames, UnitSnapshot};

use crate::error::LedgerError;
use crate::resolver::{ConfigResolver, NameQuery};
use crate::store::UnitStore;

pub struct SnapshotService {
    units: Arc<dyn UnitStore>,
    resolver: Arc<dyn ConfigResolver>,
    unknown_label: String,
}

impl SnapshotService {
    pub fn new(
        units: Arc<dyn UnitStore>,
        resolver: Arc<dyn ConfigResolver>,
        unknown_label: impl Into<String>,
    ) -> Self {
        Self {
            units,
            resolver,
            unknown_label: unknown_label.into(),
        }
    }

    /// One snapshot per requested id, in request order.
    ///
    /// Names are resolved in a single batch. A unit that no longer exists
    /// yields a placeholder instead of an error.
    pub fn snapshot(&self, unit_ids: &[UnitId]) -> Result<Vec<UnitSnapshot>, LedgerError> {
        let found: HashMap<UnitId, _> = self
            .units
            .get_many(unit_ids)?
            .into_iter()
            .map(|u| (u.id_typed(), u))
            .collect();

        let query = NameQuery::for_units(found.values());
        let names = if query.is_empty() {
            ConfigNames::default()
        } else {
            self.resolver.resolve(&query)?
        };

        let at = Utc::now();
        let snapshots: Vec<UnitSnapshot> = unit_ids
            .iter()
            .map(|id| match found.get(id) {
                Some(unit) => UnitSnapshot::capture(unit, &names, at),
                None => UnitSnapshot::placeholder(*id, &self.unknown_label, at),
            })
            .collect();
        debug!(
            requested = unit_ids.len(),
            placeholders = snapshots.iter().filter(|s| !s.resolved).count(),
            "snapshots captured"
        );
        Ok(snapshots)
    }
}
