//! Config Resolver: batch lookup of category/status/condition display names.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use equiptrack_core::{CategoryId, ConditionId, StatusId};
use equiptrack_inventory::{ConfigNames, InventoryItem};

use crate::store::StoreError;

/// Ids to resolve in one round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameQuery {
    pub categories: BTreeSet<CategoryId>,
    pub statuses: BTreeSet<StatusId>,
    pub conditions: BTreeSet<ConditionId>,
}

impl NameQuery {
    /// Collect every distinct id referenced by `units`.
    pub fn for_units<'a>(units: impl IntoIterator<Item = &'a InventoryItem>) -> Self {
        let mut query = Self::default();
        for unit in units {
            query.categories.insert(unit.category_id().clone());
            query.statuses.insert(unit.status_id().clone());
            query.conditions.insert(unit.condition_id().clone());
        }
        query
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.statuses.is_empty() && self.conditions.is_empty()
    }
}

/// Resolves names for every id in a query at once; unknown ids are absent.
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, query: &NameQuery) -> Result<ConfigNames, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    categories: HashMap<CategoryId, String>,
    statuses: HashMap<StatusId, String>,
    conditions: HashMap<ConditionId, String>,
}

/// In-memory name tables.
#[derive(Debug, Default)]
pub struct InMemoryConfigResolver {
    tables: RwLock<Tables>,
    lookups: AtomicUsize,
}

impl InMemoryConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(self, id: CategoryId, name: impl Into<String>) -> Self {
        self.set_category(id, name);
        self
    }

    pub fn with_status(self, id: StatusId, name: impl Into<String>) -> Self {
        if let Ok(mut t) = self.tables.write() {
            t.statuses.insert(id, name.into());
        }
        self
    }

    pub fn with_condition(self, id: ConditionId, name: impl Into<String>) -> Self {
        if let Ok(mut t) = self.tables.write() {
            t.conditions.insert(id, name.into());
        }
        self
    }

    /// Insert or rename a category.
    pub fn set_category(&self, id: CategoryId, name: impl Into<String>) {
        if let Ok(mut t) = self.tables.write() {
            t.categories.insert(id, name.into());
        }
    }

    pub fn remove_category(&self, id: &CategoryId) {
        if let Ok(mut t) = self.tables.write() {
            t.categories.remove(id);
        }
    }

    /// Number of `resolve` calls served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl ConfigResolver for InMemoryConfigResolver {
    fn resolve(&self, query: &NameQuery) -> Result<ConfigNames, StoreError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let t = self.tables.read().map_err(|_| StoreError::poisoned())?;
        Ok(ConfigNames {
            categories: pick(&t.categories, &query.categories),
            statuses: pick(&t.statuses, &query.statuses),
            conditions: pick(&t.conditions, &query.conditions),
        })
    }
}

fn pick<K>(table: &HashMap<K, String>, wanted: &BTreeSet<K>) -> HashMap<K, String>
where
    K: Clone + Eq + std::hash::Hash,
{
    wanted
        .iter()
        .filter_map(|k| table.get(k).map(|name| (k.clone(), name.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_only_requested_known_ids() {
        let resolver = InMemoryConfigResolver::new()
            .with_category(CategoryId::parse("cat-1").unwrap(), "Laptops")
            .with_category(CategoryId::parse("cat-2").unwrap(), "Phones");

        let mut query = NameQuery::default();
        query.categories.insert(CategoryId::parse("cat-1").unwrap());
        query.categories.insert(CategoryId::parse("cat-9").unwrap());

        let names = resolver.resolve(&query).unwrap();
        assert_eq!(names.categories.len(), 1);
        assert_eq!(
            names.category(&CategoryId::parse("cat-1").unwrap()),
            Some("Laptops")
        );
        assert_eq!(resolver.lookups(), 1);
    }

    #[test]
    fn renames_are_visible_to_later_lookups() {
        let id = CategoryId::parse("cat-1").unwrap();
        let resolver = InMemoryConfigResolver::new().with_category(id.clone(), "Laptops");
        resolver.set_category(id.clone(), "Notebooks");

        let mut query = NameQuery::default();
        query.categories.insert(id.clone());
        assert_eq!(
            resolver.resolve(&query).unwrap().category(&id),
            Some("Notebooks")
        );
    }
}
