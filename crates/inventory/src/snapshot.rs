//! Frozen copies of unit identity embedded in request/return line items.
//!
//! A snapshot is never refreshed. Later deletion of the unit or renaming of a
//! configuration entry must not change what a historical record displays.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use equiptrack_core::{CategoryId, ConditionId, StatusId, UnitId};

use crate::unit::{Identifier, InventoryItem};

/// Human-readable names resolved in one batch for a set of units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigNames {
    pub categories: HashMap<CategoryId, String>,
    pub statuses: HashMap<StatusId, String>,
    pub conditions: HashMap<ConditionId, String>,
}

impl ConfigNames {
    pub fn category(&self, id: &CategoryId) -> Option<&str> {
        self.categories.get(id).map(String::as_str)
    }

    pub fn status(&self, id: &StatusId) -> Option<&str> {
        self.statuses.get(id).map(String::as_str)
    }

    pub fn condition(&self, id: &ConditionId) -> Option<&str> {
        self.conditions.get(id).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub unit_id: UnitId,
    pub item_name: String,
    pub category_id: Option<CategoryId>,
    pub category_name: String,
    pub identifier: Option<Identifier>,
    pub status_id: Option<StatusId>,
    pub status_name: String,
    pub condition_id: Option<ConditionId>,
    pub condition_name: String,
    pub captured_at: DateTime<Utc>,
    /// False for placeholder snapshots of units that no longer existed.
    pub resolved: bool,
}

impl UnitSnapshot {
    /// Freeze `unit` with names from `names`.
    ///
    /// A configuration entry that has disappeared falls back to its raw id.
    pub fn capture(unit: &InventoryItem, names: &ConfigNames, at: DateTime<Utc>) -> Self {
        let category_id = unit.category_id().clone();
        let status_id = unit.status_id().clone();
        let condition_id = unit.condition_id().clone();
        Self {
            unit_id: unit.id_typed(),
            item_name: unit.item_type().to_string(),
            category_name: names
                .category(&category_id)
                .map_or_else(|| category_id.to_string(), str::to_string),
            status_name: names
                .status(&status_id)
                .map_or_else(|| status_id.to_string(), str::to_string),
            condition_name: names
                .condition(&condition_id)
                .map_or_else(|| condition_id.to_string(), str::to_string),
            category_id: Some(category_id),
            identifier: unit.identifier().cloned(),
            status_id: Some(status_id),
            condition_id: Some(condition_id),
            captured_at: at,
            resolved: true,
        }
    }

    /// Best-effort stand-in for a unit that was already gone.
    pub fn placeholder(unit_id: UnitId, label: &str, at: DateTime<Utc>) -> Self {
        Self {
            unit_id,
            item_name: label.to_string(),
            category_id: None,
            category_name: label.to_string(),
            identifier: None,
            status_id: None,
            status_name: label.to_string(),
            condition_id: None,
            condition_name: label.to_string(),
            captured_at: at,
            resolved: false,
        }
    }

    /// Serial or phone number as shown in listings.
    pub fn display_identifier(&self) -> &str {
        self.identifier.as_ref().map_or("-", Identifier::value)
    }
}
