use std::collections::BTreeMap;
use std::sync::RwLock;

use equiptrack_inventory::{InventoryMaster, ItemKey};

use super::StoreError;

/// Storage for the derived `InventoryMaster` rows.
///
/// Only the aggregate cache writes here, always with fully recomputed counts.
pub trait AggregateStore: Send + Sync {
    fn get(&self, key: &ItemKey) -> Result<Option<InventoryMaster>, StoreError>;

    fn upsert(&self, master: InventoryMaster) -> Result<(), StoreError>;

    /// Returns `false` when no row existed.
    fn delete(&self, key: &ItemKey) -> Result<bool, StoreError>;

    fn list(&self) -> Result<Vec<InventoryMaster>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAggregateStore {
    rows: RwLock<BTreeMap<ItemKey, InventoryMaster>>,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregateStore for InMemoryAggregateStore {
    fn get(&self, key: &ItemKey) -> Result<Option<InventoryMaster>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned())?;
        Ok(rows.get(key).cloned())
    }

    fn upsert(&self, master: InventoryMaster) -> Result<(), StoreError> {
        if master.counts.is_empty() {
            return Err(StoreError::Rejected(format!(
                "aggregate for {} has no units; delete it instead",
                master.key
            )));
        }
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned())?;
        rows.insert(master.key.clone(), master);
        Ok(())
    }

    fn delete(&self, key: &ItemKey) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned())?;
        Ok(rows.remove(key).is_some())
    }

    fn list(&self) -> Result<Vec<InventoryMaster>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned())?;
        Ok(rows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use equiptrack_core::CategoryId;
    use equiptrack_inventory::AggregateCounts;

    fn key() -> ItemKey {
        ItemKey::new("Dell01", CategoryId::parse("laptops").unwrap()).unwrap()
    }

    #[test]
    fn zero_rows_are_never_stored() {
        let store = InMemoryAggregateStore::new();
        let empty = InventoryMaster::new(key(), AggregateCounts::default(), Utc::now());
        assert!(matches!(store.upsert(empty), Err(StoreError::Rejected(_))));
        assert!(store.get(&key()).unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let store = InMemoryAggregateStore::new();
        let counts = AggregateCounts {
            total_quantity: 2,
            available_quantity: 1,
            user_owned_quantity: 1,
        };
        store
            .upsert(InventoryMaster::new(key(), counts, Utc::now()))
            .unwrap();
        assert_eq!(store.get(&key()).unwrap().unwrap().counts, counts);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(store.delete(&key()).unwrap());
        assert!(!store.delete(&key()).unwrap());
    }
}
