use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use equiptrack_core::{AggregateRoot, ExpectedVersion, INITIAL_VERSION, UnitId};
use equiptrack_inventory::{InventoryItem, ItemKey};

use super::StoreError;

/// Unit collection with per-unit compare-and-set writes.
///
/// Versions start at 1 on insert and advance by one on every accepted update.
pub trait UnitStore: Send + Sync {
    fn get(&self, id: UnitId) -> Result<Option<InventoryItem>, StoreError>;

    /// Fetch many units in one round trip. Missing ids are simply absent.
    fn get_many(&self, ids: &[UnitId]) -> Result<Vec<InventoryItem>, StoreError>;

    fn insert(&self, unit: InventoryItem) -> Result<InventoryItem, StoreError>;

    /// Replace a unit if its stored version satisfies `expected`.
    fn update(
        &self,
        unit: InventoryItem,
        expected: ExpectedVersion,
    ) -> Result<InventoryItem, StoreError>;

    /// All rows of one item key, soft-deleted ones included, oldest intake first.
    fn list_by_key(&self, key: &ItemKey) -> Result<Vec<InventoryItem>, StoreError>;

    /// Every item key that still has at least one row.
    fn keys(&self) -> Result<Vec<ItemKey>, StoreError>;

    /// Physically remove a purge-eligible unit.
    fn delete_purged(&self, id: UnitId, expected: ExpectedVersion) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    units: HashMap<UnitId, InventoryItem>,
    by_key: HashMap<ItemKey, BTreeSet<UnitId>>,
}

/// In-memory unit store.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryUnitStore {
    inner: RwLock<Inner>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.units.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_row(unit: &InventoryItem) -> Result<(), StoreError> {
    unit.validate()
        .map_err(|e| StoreError::Rejected(e.to_string()))
}

impl UnitStore for InMemoryUnitStore {
    fn get(&self, id: UnitId) -> Result<Option<InventoryItem>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(inner.units.get(&id).cloned())
    }

    fn get_many(&self, ids: &[UnitId]) -> Result<Vec<InventoryItem>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(ids.iter().filter_map(|id| inner.units.get(id).cloned()).collect())
    }

    fn insert(&self, mut unit: InventoryItem) -> Result<InventoryItem, StoreError> {
        check_row(&unit)?;
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let id = unit.id_typed();
        if inner.units.contains_key(&id) {
            return Err(StoreError::Duplicate(format!("unit {id} already exists")));
        }
        unit.stamp_version(INITIAL_VERSION);
        inner
            .by_key
            .entry(unit.key().clone())
            .or_default()
            .insert(id);
        inner.units.insert(id, unit.clone());
        Ok(unit)
    }

    fn update(
        &self,
        mut unit: InventoryItem,
        expected: ExpectedVersion,
    ) -> Result<InventoryItem, StoreError> {
        check_row(&unit)?;
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let id = unit.id_typed();
        let Some(current) = inner.units.get(&id) else {
            return Err(StoreError::Rejected(format!("unit {id} does not exist")));
        };
        if !expected.matches(current.version()) {
            return Err(StoreError::VersionConflict(format!(
                "unit {id}: expected {expected}, found version {}",
                current.version()
            )));
        }
        if current.key() != unit.key() {
            return Err(StoreError::Rejected(format!(
                "unit {id} cannot move from {} to {}",
                current.key(),
                unit.key()
            )));
        }
        unit.stamp_version(current.version() + 1);
        inner.units.insert(id, unit.clone());
        Ok(unit)
    }

    fn list_by_key(&self, key: &ItemKey) -> Result<Vec<InventoryItem>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        let mut units: Vec<InventoryItem> = inner
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.units.get(id).cloned())
            .collect();
        units.sort_by_key(|u| (u.provenance().created_at, u.id_typed()));
        Ok(units)
    }

    fn keys(&self) -> Result<Vec<ItemKey>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        let mut keys: Vec<ItemKey> = inner
            .by_key
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete_purged(&self, id: UnitId, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let Some(current) = inner.units.get(&id) else {
            return Err(StoreError::Rejected(format!("unit {id} does not exist")));
        };
        if !expected.matches(current.version()) {
            return Err(StoreError::VersionConflict(format!(
                "unit {id}: expected {expected}, found version {}",
                current.version()
            )));
        }
        if !current.is_purge_eligible() {
            return Err(StoreError::Rejected(format!(
                "unit {id} is not soft-deleted admin stock"
            )));
        }
        let key = current.key().clone();
        inner.units.remove(&id);
        if let Some(ids) = inner.by_key.get_mut(&key) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_key.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use equiptrack_core::{CategoryId, ConditionId, StatusId, UserId};
    use equiptrack_inventory::{NewUnit, Owner};

    fn key() -> ItemKey {
        ItemKey::new("Dell01", CategoryId::parse("laptops").unwrap()).unwrap()
    }

    fn unit() -> InventoryItem {
        InventoryItem::admin_intake(
            UnitId::new(),
            NewUnit {
                key: key(),
                identifier: None,
                status_id: StatusId::parse("available").unwrap(),
                condition_id: ConditionId::parse("working").unwrap(),
            },
            "admin",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn insert_stamps_version_and_rejects_duplicates() {
        let store = InMemoryUnitStore::new();
        let u = unit();
        let stored = store.insert(u.clone()).unwrap();
        assert_eq!(stored.version(), 1);
        assert!(matches!(store.insert(u), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn update_is_compare_and_set() {
        let store = InMemoryUnitStore::new();
        let mut u = store.insert(unit()).unwrap();
        u.reassign(
            &Owner::AdminStock,
            Owner::user(UserId::parse("alice").unwrap()),
            Utc::now(),
        )
        .unwrap();

        let written = store.update(u.clone(), ExpectedVersion::Exact(1)).unwrap();
        assert_eq!(written.version(), 2);

        let stale = store.update(u, ExpectedVersion::Exact(1));
        assert!(matches!(stale, Err(StoreError::VersionConflict(_))));
    }

    #[test]
    fn list_by_key_includes_soft_deleted_rows() {
        let store = InMemoryUnitStore::new();
        let a = store.insert(unit()).unwrap();
        let mut b = store.insert(unit()).unwrap();
        b.soft_delete("retired", "admin", Utc::now()).unwrap();
        store.update(b, ExpectedVersion::Exact(1)).unwrap();

        let rows = store.list_by_key(&key()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id_typed(), a.id_typed());
        assert_eq!(store.keys().unwrap(), vec![key()]);
    }

    #[test]
    fn delete_purged_requires_soft_delete() {
        let store = InMemoryUnitStore::new();
        let mut u = store.insert(unit()).unwrap();
        let id = u.id_typed();
        assert!(matches!(
            store.delete_purged(id, ExpectedVersion::Exact(1)),
            Err(StoreError::Rejected(_))
        ));

        u.soft_delete("retired", "admin", Utc::now()).unwrap();
        store.update(u, ExpectedVersion::Exact(1)).unwrap();
        store.delete_purged(id, ExpectedVersion::Exact(2)).unwrap();

        assert!(store.get(id).unwrap().is_none());
        assert!(store.keys().unwrap().is_empty());
    }
}
