use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use equiptrack_core::{
    AggregateRoot, CategoryId, ConditionId, DomainError, DomainResult, StatusId, UnitId, UserId,
};

/// Aggregate key: one `InventoryMaster` row exists per (item-type, category).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    item_type: String,
    category_id: CategoryId,
}

impl ItemKey {
    pub fn new(item_type: impl Into<String>, category_id: CategoryId) -> DomainResult<Self> {
        let item_type = item_type.into().trim().to_string();
        if item_type.is_empty() {
            return Err(DomainError::validation("item type cannot be empty"));
        }
        Ok(Self {
            item_type,
            category_id,
        })
    }

    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    pub fn category_id(&self) -> &CategoryId {
        &self.category_id
    }
}

impl core::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} [{}]", self.item_type, self.category_id)
    }
}

/// Identifying attribute of a unit. A unit carries at most one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Identifier {
    Serial(String),
    Phone(String),
}

impl Identifier {
    pub fn serial(value: impl Into<String>) -> DomainResult<Self> {
        Ok(Self::Serial(non_blank(value.into(), "serial number")?))
    }

    pub fn phone(value: impl Into<String>) -> DomainResult<Self> {
        Ok(Self::Phone(non_blank(value.into(), "phone number")?))
    }

    pub fn value(&self) -> &str {
        match self {
            Identifier::Serial(v) | Identifier::Phone(v) => v,
        }
    }

    /// Serial numbers compare case-insensitively; phone numbers exactly.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        match self {
            Identifier::Serial(v) => v.eq_ignore_ascii_case(candidate),
            Identifier::Phone(v) => v == candidate,
        }
    }
}

impl core::fmt::Display for Identifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Identifier::Serial(v) => write!(f, "S/N {v}"),
            Identifier::Phone(v) => write!(f, "tel {v}"),
        }
    }
}

fn non_blank(value: String, what: &str) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{what} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

/// Ownership state label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    AdminStock,
    UserOwned,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::AdminStock => "admin_stock",
            OwnerType::UserOwned => "user_owned",
        }
    }
}

/// Who holds a unit.
///
/// `UserOwned` always carries a (non-empty) `UserId`, so the
/// "user-owned implies user id" invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "owner_type", content = "user_id", rename_all = "snake_case")]
pub enum Owner {
    AdminStock,
    UserOwned(UserId),
}

impl Owner {
    pub fn user(user_id: UserId) -> Self {
        Self::UserOwned(user_id)
    }

    pub fn owner_type(&self) -> OwnerType {
        match self {
            Owner::AdminStock => OwnerType::AdminStock,
            Owner::UserOwned(_) => OwnerType::UserOwned,
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Owner::AdminStock => None,
            Owner::UserOwned(u) => Some(u),
        }
    }

    /// Rebuild an owner from its persisted columns.
    pub fn from_parts(owner_type: OwnerType, user_id: Option<UserId>) -> DomainResult<Self> {
        match (owner_type, user_id) {
            (OwnerType::AdminStock, None) => Ok(Owner::AdminStock),
            (OwnerType::AdminStock, Some(_)) => Err(DomainError::invariant(
                "admin stock ownership cannot carry a user id",
            )),
            (OwnerType::UserOwned, Some(u)) => Ok(Owner::UserOwned(u)),
            (OwnerType::UserOwned, None) => Err(DomainError::invariant(
                "user-owned ownership requires a user id",
            )),
        }
    }
}

impl core::fmt::Display for Owner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Owner::AdminStock => f.write_str("admin_stock"),
            Owner::UserOwned(u) => write!(f, "user_owned({u})"),
        }
    }
}

/// Current ownership of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    owner: Owner,
    owned_since: DateTime<Utc>,
}

impl Ownership {
    pub fn new(owner: Owner, owned_since: DateTime<Utc>) -> Self {
        Self { owner, owned_since }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn owner_type(&self) -> OwnerType {
        self.owner.owner_type()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.owner.user_id()
    }

    pub fn owned_since(&self) -> DateTime<Utc> {
        self.owned_since
    }
}

/// How a unit entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSource {
    AdminAdded,
    UserReported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: UnitSource,
    pub initial_owner: Owner,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Soft-delete marker: the unit is logically gone but retained for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDelete {
    pub deleted_at: DateTime<Utc>,
    pub reason: String,
    pub deleted_by: String,
}

/// Lifecycle label: `active → soft_deleted → purged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Active,
    SoftDeleted,
    Purged,
}

/// Status/condition pair that makes an admin-stock unit issuable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessRule {
    pub status: StatusId,
    pub condition: ConditionId,
}

impl ReadinessRule {
    pub fn new(status: StatusId, condition: ConditionId) -> Self {
        Self { status, condition }
    }

    pub fn admits(&self, status: &StatusId, condition: &ConditionId) -> bool {
        &self.status == status && &self.condition == condition
    }
}

/// Intake payload for a new unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUnit {
    pub key: ItemKey,
    pub identifier: Option<Identifier>,
    pub status_id: StatusId,
    pub condition_id: ConditionId,
}

/// Outcome of checking a requested transfer against the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferDecision {
    /// Current owner matches `from`; the transfer should be applied.
    Apply,
    /// The unit is already held by `to` (retry of a completed transfer).
    AlreadyApplied,
    /// The stated current owner does not match.
    Mismatch { actual: Owner },
    /// Soft-deleted units cannot change hands.
    Deleted,
}

/// One physical unit (`InventoryItem`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    id: UnitId,
    key: ItemKey,
    identifier: Option<Identifier>,
    ownership: Ownership,
    status_id: StatusId,
    condition_id: ConditionId,
    provenance: Provenance,
    deletion: Option<SoftDelete>,
    version: u64,
}

impl InventoryItem {
    /// Admin intake: the unit starts in admin stock.
    pub fn admin_intake(
        id: UnitId,
        new: NewUnit,
        created_by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        Self::intake(id, new, UnitSource::AdminAdded, Owner::AdminStock, created_by, at)
    }

    /// User self-report: the unit starts owned by the reporting user.
    pub fn user_reported(
        id: UnitId,
        new: NewUnit,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let created_by = user_id.to_string();
        Self::intake(
            id,
            new,
            UnitSource::UserReported,
            Owner::UserOwned(user_id),
            created_by,
            at,
        )
    }

    fn intake(
        id: UnitId,
        new: NewUnit,
        source: UnitSource,
        owner: Owner,
        created_by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let created_by = created_by.into();
        if created_by.trim().is_empty() {
            return Err(DomainError::validation("created_by cannot be empty"));
        }
        Ok(Self {
            id,
            key: new.key,
            identifier: new.identifier,
            ownership: Ownership::new(owner.clone(), at),
            status_id: new.status_id,
            condition_id: new.condition_id,
            provenance: Provenance {
                source,
                initial_owner: owner,
                created_at: at,
                created_by,
            },
            deletion: None,
            version: 0,
        })
    }

    pub fn id_typed(&self) -> UnitId {
        self.id
    }

    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    pub fn item_type(&self) -> &str {
        self.key.item_type()
    }

    pub fn category_id(&self) -> &CategoryId {
        self.key.category_id()
    }

    pub fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    pub fn owner(&self) -> &Owner {
        self.ownership.owner()
    }

    pub fn status_id(&self) -> &StatusId {
        &self.status_id
    }

    pub fn condition_id(&self) -> &ConditionId {
        &self.condition_id
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn deletion(&self) -> Option<&SoftDelete> {
        self.deletion.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion.is_some()
    }

    pub fn is_admin_stock(&self) -> bool {
        matches!(self.owner(), Owner::AdminStock)
    }

    pub fn state(&self) -> UnitState {
        if self.is_deleted() {
            UnitState::SoftDeleted
        } else {
            UnitState::Active
        }
    }

    /// Issuable: active, in admin stock, and in the ready status/condition.
    pub fn is_ready(&self, rule: &ReadinessRule) -> bool {
        !self.is_deleted()
            && self.is_admin_stock()
            && rule.admits(&self.status_id, &self.condition_id)
    }

    /// Eligible for purge: soft-deleted and back in admin stock.
    pub fn is_purge_eligible(&self) -> bool {
        self.is_deleted() && self.is_admin_stock()
    }

    /// Set by storage adapters after an accepted write.
    pub fn stamp_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn check_transfer(&self, from: &Owner, to: &Owner) -> TransferDecision {
        if self.is_deleted() {
            return TransferDecision::Deleted;
        }
        let current = self.owner();
        if current == to {
            return TransferDecision::AlreadyApplied;
        }
        if current != from {
            return TransferDecision::Mismatch {
                actual: current.clone(),
            };
        }
        TransferDecision::Apply
    }

    /// Move the unit to `to`. Callers must have obtained `TransferDecision::Apply`.
    pub fn reassign(&mut self, from: &Owner, to: Owner, at: DateTime<Utc>) -> DomainResult<()> {
        match self.check_transfer(from, &to) {
            TransferDecision::Apply => {
                self.ownership = Ownership::new(to, at);
                Ok(())
            }
            TransferDecision::AlreadyApplied => Ok(()),
            TransferDecision::Mismatch { actual } => Err(DomainError::conflict(format!(
                "unit {} is owned by {actual}, not {from}",
                self.id
            ))),
            TransferDecision::Deleted => Err(DomainError::invariant(format!(
                "unit {} is soft-deleted",
                self.id
            ))),
        }
    }

    pub fn set_status(&mut self, status_id: StatusId) -> DomainResult<()> {
        self.ensure_active()?;
        self.status_id = status_id;
        Ok(())
    }

    pub fn set_condition(&mut self, condition_id: ConditionId) -> DomainResult<()> {
        self.ensure_active()?;
        self.condition_id = condition_id;
        Ok(())
    }

    /// Mark the unit logically gone. Returns `false` when it was already deleted.
    ///
    /// User-owned units cannot be deleted; they must be returned first.
    pub fn soft_delete(
        &mut self,
        reason: impl Into<String>,
        deleted_by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<bool> {
        if self.is_deleted() {
            return Ok(false);
        }
        if !self.is_admin_stock() {
            return Err(DomainError::invariant(format!(
                "unit {} is held by {} and cannot be deleted",
                self.id,
                self.owner()
            )));
        }
        self.deletion = Some(SoftDelete {
            deleted_at: at,
            reason: reason.into(),
            deleted_by: deleted_by.into(),
        });
        Ok(true)
    }

    /// Final lifecycle transition `soft_deleted → purged`.
    pub fn purge(self, at: DateTime<Utc>) -> DomainResult<PurgedUnit> {
        if !self.is_deleted() {
            return Err(DomainError::invariant(format!(
                "unit {} is active and cannot be purged",
                self.id
            )));
        }
        if !self.is_admin_stock() {
            return Err(DomainError::invariant(format!(
                "unit {} is held by {} and cannot be purged",
                self.id,
                self.owner()
            )));
        }
        Ok(PurgedUnit {
            unit: self,
            purged_at: at,
        })
    }

    /// Check the record invariants (used after loading persisted rows).
    pub fn validate(&self) -> DomainResult<()> {
        if self.key.item_type().trim().is_empty() {
            return Err(DomainError::invariant("item type cannot be empty"));
        }
        if let Some(identifier) = &self.identifier {
            if identifier.value().trim().is_empty() {
                return Err(DomainError::invariant("identifier cannot be empty"));
            }
        }
        if self.deletion.is_some() && !self.is_admin_stock() {
            return Err(DomainError::invariant(format!(
                "unit {} is soft-deleted while user-owned",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_active(&self) -> DomainResult<()> {
        if self.is_deleted() {
            return Err(DomainError::invariant(format!(
                "unit {} is soft-deleted",
                self.id
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for InventoryItem {
    type Id = UnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// A unit that completed the `soft_deleted → purged` transition.
///
/// Only the reconciliation job produces these; the record is handed to the
/// Transfer Ledger for the permanent removal entry before the row is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgedUnit {
    unit: InventoryItem,
    purged_at: DateTime<Utc>,
}

impl PurgedUnit {
    pub fn unit(&self) -> &InventoryItem {
        &self.unit
    }

    pub fn purged_at(&self) -> DateTime<Utc> {
        self.purged_at
    }

    pub fn state(&self) -> UnitState {
        UnitState::Purged
    }
}
