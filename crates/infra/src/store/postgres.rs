//! Postgres adapter for every ledger storage port.
//!
//! The ports are synchronous, so the store owns a small Tokio runtime and
//! blocks on it. Do not call it from inside another async runtime.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |------------|---------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check / not-null violation) | `23514`, `23502` | `Rejected` |
//! | Database (serialization failure) | `40001` | `VersionConflict` |
//! | Database (statement timeout) | `57014` | `Timeout` |
//! | Database (other) | any | `Rejected` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | Decode / ColumnDecode | N/A | `Corrupt` |
//! | Io, Tls, PoolClosed, other | N/A | `Unavailable` |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use equiptrack_core::{
    CategoryId, ConditionId, ExpectedVersion, INITIAL_VERSION, StatusId, UnitId,
};
use equiptrack_inventory::{
    AggregateCounts, ConfigNames, InventoryItem, InventoryMaster, ItemKey, TransferRecord,
};

use super::{AggregateStore, StoreError, TransferLedger, UnitStore};
use crate::locks::{LeaseToken, LockProvider};
use crate::resolver::{ConfigResolver, NameQuery};

const SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

/// Postgres-backed unit store, aggregate store, transfer ledger, config
/// resolver and lease provider.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PostgresLedgerStore {
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("tokio runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    /// Create missing tables, indexes and the append-only trigger.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.block(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
            Ok(())
        })
    }

    fn block<T>(&self, fut: impl Future<Output = T>) -> T {
        self.runtime.block_on(fut)
    }

    async fn unit_version(&self, id: UnitId) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT version FROM inventory_units WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("unit_version", e))?;
        row.map(|r| r.try_get::<i64, _>("version").map(|v| v as u64))
            .transpose()
            .map_err(|e| map_sqlx_error("unit_version", e))
    }
}

impl std::fmt::Debug for PostgresLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLedgerStore").finish_non_exhaustive()
    }
}

fn expected_bind(expected: ExpectedVersion) -> Option<i64> {
    expected.exact().map(|v| v as i64)
}

fn decode_unit(row: &sqlx::postgres::PgRow) -> Result<InventoryItem, StoreError> {
    let version: i64 = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("decode unit", e))?;
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| map_sqlx_error("decode unit", e))?;
    let mut unit: InventoryItem =
        serde_json::from_value(body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    unit.stamp_version(version as u64);
    unit.validate()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(unit)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Rejected(e.to_string()))
}

impl UnitStore for PostgresLedgerStore {
    fn get(&self, id: UnitId) -> Result<Option<InventoryItem>, StoreError> {
        self.block(async {
            let row = sqlx::query("SELECT version, body FROM inventory_units WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get unit", e))?;
            row.as_ref().map(decode_unit).transpose()
        })
    }

    fn get_many(&self, ids: &[UnitId]) -> Result<Vec<InventoryItem>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        self.block(async {
            let rows = sqlx::query("SELECT version, body FROM inventory_units WHERE id = ANY($1)")
                .bind(&uuids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get units", e))?;
            rows.iter().map(decode_unit).collect()
        })
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id_typed()))]
    fn insert(&self, mut unit: InventoryItem) -> Result<InventoryItem, StoreError> {
        unit.validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        unit.stamp_version(INITIAL_VERSION);
        let body = encode(&unit)?;
        self.block(async {
            sqlx::query(
                r#"
                INSERT INTO inventory_units
                    (id, item_type, category_id, version, body, owner_type, user_id, deleted)
                VALUES ($1, $2, $3, 1, $4, $5, $6, $7)
                "#,
            )
            .bind(*unit.id_typed().as_uuid())
            .bind(unit.item_type())
            .bind(unit.category_id().as_str())
            .bind(&body)
            .bind(unit.owner().owner_type().as_str())
            .bind(unit.owner().user_id().map(|u| u.as_str().to_string()))
            .bind(unit.is_deleted())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert unit", e))?;
            Ok::<(), StoreError>(())
        })?;
        Ok(unit)
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id_typed()))]
    fn update(
        &self,
        mut unit: InventoryItem,
        expected: ExpectedVersion,
    ) -> Result<InventoryItem, StoreError> {
        unit.validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let id = unit.id_typed();
        self.block(async {
            let body = encode(&unit)?;
            let row = sqlx::query(
                r#"
                UPDATE inventory_units
                SET version = version + 1,
                    body = $2,
                    owner_type = $3,
                    user_id = $4,
                    deleted = $5,
                    updated_at = now()
                WHERE id = $1
                  AND ($6::BIGINT IS NULL OR version = $6)
                RETURNING version
                "#,
            )
            .bind(*id.as_uuid())
            .bind(&body)
            .bind(unit.owner().owner_type().as_str())
            .bind(unit.owner().user_id().map(|u| u.as_str().to_string()))
            .bind(unit.is_deleted())
            .bind(expected_bind(expected))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update unit", e))?;

            match row {
                Some(row) => {
                    let version: i64 = row
                        .try_get("version")
                        .map_err(|e| map_sqlx_error("update unit", e))?;
                    unit.stamp_version(version as u64);
                    Ok(unit)
                }
                None => match self.unit_version(id).await? {
                    Some(found) => Err(StoreError::VersionConflict(format!(
                        "unit {id}: expected {expected}, found version {found}"
                    ))),
                    None => Err(StoreError::Rejected(format!("unit {id} does not exist"))),
                },
            }
        })
    }

    fn list_by_key(&self, key: &ItemKey) -> Result<Vec<InventoryItem>, StoreError> {
        self.block(async {
            let rows = sqlx::query(
                "SELECT version, body FROM inventory_units WHERE item_type = $1 AND category_id = $2",
            )
            .bind(key.item_type())
            .bind(key.category_id().as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list units", e))?;
            let mut units = rows.iter().map(decode_unit).collect::<Result<Vec<_>, _>>()?;
            units.sort_by_key(|u| (u.provenance().created_at, u.id_typed()));
            Ok(units)
        })
    }

    fn keys(&self) -> Result<Vec<ItemKey>, StoreError> {
        self.block(async {
            let rows = sqlx::query(
                "SELECT DISTINCT item_type, category_id FROM inventory_units ORDER BY 1, 2",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list keys", e))?;
            rows.iter().map(decode_key).collect()
        })
    }

    #[instrument(skip(self))]
    fn delete_purged(&self, id: UnitId, expected: ExpectedVersion) -> Result<(), StoreError> {
        self.block(async {
            let result = sqlx::query(
                r#"
                DELETE FROM inventory_units
                WHERE id = $1
                  AND ($2::BIGINT IS NULL OR version = $2)
                  AND deleted
                  AND owner_type = 'admin_stock'
                "#,
            )
            .bind(*id.as_uuid())
            .bind(expected_bind(expected))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete unit", e))?;

            if result.rows_affected() == 1 {
                debug!(unit_id = %id, "unit row deleted");
                return Ok(());
            }
            match self.unit_version(id).await? {
                None => Err(StoreError::Rejected(format!("unit {id} does not exist"))),
                Some(found) if !expected.matches(found) => Err(StoreError::VersionConflict(
                    format!("unit {id}: expected {expected}, found version {found}"),
                )),
                Some(_) => Err(StoreError::Rejected(format!(
                    "unit {id} is not soft-deleted admin stock"
                ))),
            }
        })
    }
}

fn decode_key(row: &sqlx::postgres::PgRow) -> Result<ItemKey, StoreError> {
    let item_type: String = row
        .try_get("item_type")
        .map_err(|e| map_sqlx_error("decode key", e))?;
    let category: String = row
        .try_get("category_id")
        .map_err(|e| map_sqlx_error("decode key", e))?;
    let category = CategoryId::parse(category).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    ItemKey::new(item_type, category).map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl AggregateStore for PostgresLedgerStore {
    fn get(&self, key: &ItemKey) -> Result<Option<InventoryMaster>, StoreError> {
        self.block(async {
            let row = sqlx::query(
                r#"
                SELECT item_type, category_id, total_quantity, available_quantity,
                       user_owned_quantity, recomputed_at
                FROM inventory_masters
                WHERE item_type = $1 AND category_id = $2
                "#,
            )
            .bind(key.item_type())
            .bind(key.category_id().as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get aggregate", e))?;
            row.as_ref().map(decode_master).transpose()
        })
    }

    fn upsert(&self, master: InventoryMaster) -> Result<(), StoreError> {
        if master.counts.is_empty() {
            return Err(StoreError::Rejected(format!(
                "aggregate for {} has no units; delete it instead",
                master.key
            )));
        }
        self.block(async {
            sqlx::query(
                r#"
                INSERT INTO inventory_masters
                    (item_type, category_id, total_quantity, available_quantity,
                     user_owned_quantity, recomputed_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (item_type, category_id) DO UPDATE
                SET total_quantity = EXCLUDED.total_quantity,
                    available_quantity = EXCLUDED.available_quantity,
                    user_owned_quantity = EXCLUDED.user_owned_quantity,
                    recomputed_at = EXCLUDED.recomputed_at
                "#,
            )
            .bind(master.key.item_type())
            .bind(master.key.category_id().as_str())
            .bind(master.counts.total_quantity as i64)
            .bind(master.counts.available_quantity as i64)
            .bind(master.counts.user_owned_quantity as i64)
            .bind(master.recomputed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert aggregate", e))?;
            Ok(())
        })
    }

    fn delete(&self, key: &ItemKey) -> Result<bool, StoreError> {
        self.block(async {
            let result = sqlx::query(
                "DELETE FROM inventory_masters WHERE item_type = $1 AND category_id = $2",
            )
            .bind(key.item_type())
            .bind(key.category_id().as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete aggregate", e))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn list(&self) -> Result<Vec<InventoryMaster>, StoreError> {
        self.block(async {
            let rows = sqlx::query(
                r#"
                SELECT item_type, category_id, total_quantity, available_quantity,
                       user_owned_quantity, recomputed_at
                FROM inventory_masters
                ORDER BY item_type, category_id
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list aggregates", e))?;
            rows.iter().map(decode_master).collect()
        })
    }
}

fn decode_master(row: &sqlx::postgres::PgRow) -> Result<InventoryMaster, StoreError> {
    let count = |column: &str| -> Result<u64, StoreError> {
        let value: i64 = row
            .try_get(column)
            .map_err(|e| map_sqlx_error("decode aggregate", e))?;
        u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}")))
    };
    let recomputed_at: DateTime<Utc> = row
        .try_get("recomputed_at")
        .map_err(|e| map_sqlx_error("decode aggregate", e))?;
    Ok(InventoryMaster::new(
        decode_key(row)?,
        AggregateCounts {
            total_quantity: count("total_quantity")?,
            available_quantity: count("available_quantity")?,
            user_owned_quantity: count("user_owned_quantity")?,
        },
        recomputed_at,
    ))
}

fn decode_record(row: &sqlx::postgres::PgRow) -> Result<TransferRecord, StoreError> {
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| map_sqlx_error("decode transfer record", e))?;
    serde_json::from_value(body).map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl TransferLedger for PostgresLedgerStore {
    #[instrument(skip(self, record), fields(transfer_id = %record.id, unit_id = %record.unit_id))]
    fn append(&self, record: TransferRecord) -> Result<(), StoreError> {
        let body = encode(&record)?;
        self.block(async {
            sqlx::query(
                r#"
                INSERT INTO transfer_log
                    (id, unit_id, transfer_type, occurred_at, retain_forever, body)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(*record.id.as_uuid())
            .bind(*record.unit_id.as_uuid())
            .bind(record.transfer_type.as_str())
            .bind(record.occurred_at)
            .bind(record.retain_forever)
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("append transfer record", e))?;
            Ok(())
        })
    }

    fn history_for_unit(&self, unit_id: UnitId) -> Result<Vec<TransferRecord>, StoreError> {
        self.block(async {
            let rows = sqlx::query("SELECT body FROM transfer_log WHERE unit_id = $1 ORDER BY seq")
                .bind(*unit_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("unit history", e))?;
            rows.iter().map(decode_record).collect()
        })
    }

    fn latest_for_unit(&self, unit_id: UnitId) -> Result<Option<TransferRecord>, StoreError> {
        self.block(async {
            let row = sqlx::query(
                "SELECT body FROM transfer_log WHERE unit_id = $1 ORDER BY seq DESC LIMIT 1",
            )
            .bind(*unit_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest transfer record", e))?;
            row.as_ref().map(decode_record).transpose()
        })
    }

    fn recorded_with_reason(&self, reason: &str) -> Result<Vec<TransferRecord>, StoreError> {
        self.block(async {
            let rows =
                sqlx::query("SELECT body FROM transfer_log WHERE body->>'reason' = $1 ORDER BY seq")
                    .bind(reason)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("records by reason", e))?;
            rows.iter().map(decode_record).collect()
        })
    }

    fn recorded_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        self.block(async {
            let rows = sqlx::query(
                r#"
                SELECT body FROM transfer_log
                WHERE NOT retain_forever AND occurred_at < $1
                ORDER BY occurred_at
                LIMIT $2
                "#,
            )
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("archivable records", e))?;
            rows.iter().map(decode_record).collect()
        })
    }

    fn count(&self) -> Result<u64, StoreError> {
        self.block(async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfer_log")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("count transfer records", e))?;
            Ok(count as u64)
        })
    }
}

impl ConfigResolver for PostgresLedgerStore {
    fn resolve(&self, query: &NameQuery) -> Result<ConfigNames, StoreError> {
        let categories: Vec<String> = query.categories.iter().map(|c| c.to_string()).collect();
        let statuses: Vec<String> = query.statuses.iter().map(|s| s.to_string()).collect();
        let conditions: Vec<String> = query.conditions.iter().map(|c| c.to_string()).collect();
        self.block(async {
            let mut names = ConfigNames::default();
            for (id, name) in self.names("config_categories", &categories).await? {
                names.categories.insert(parse_config(CategoryId::parse(id))?, name);
            }
            for (id, name) in self.names("config_statuses", &statuses).await? {
                names.statuses.insert(parse_config(StatusId::parse(id))?, name);
            }
            for (id, name) in self.names("config_conditions", &conditions).await? {
                names.conditions.insert(parse_config(ConditionId::parse(id))?, name);
            }
            Ok(names)
        })
    }
}

fn parse_config<T>(parsed: Result<T, equiptrack_core::DomainError>) -> Result<T, StoreError> {
    parsed.map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl PostgresLedgerStore {
    async fn names(&self, table: &str, ids: &[String]) -> Result<Vec<(String, String)>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        // `table` is one of three fixed names, never caller input.
        let sql = format!("SELECT id, name FROM {table} WHERE id = ANY($1)");
        sqlx::query_as::<_, (String, String)>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("resolve names", e))
    }
}

impl LockProvider for PostgresLedgerStore {
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LeaseToken>, StoreError> {
        let token = LeaseToken::new();
        self.block(async {
            let row = sqlx::query(
                r#"
                INSERT INTO ledger_leases (lock_key, token, expires_at)
                VALUES ($1, $2, now() + make_interval(secs => $3))
                ON CONFLICT (lock_key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE ledger_leases.expires_at <= now()
                RETURNING token
                "#,
            )
            .bind(key)
            .bind(token.0)
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire lease", e))?;
            Ok(row.map(|_| token))
        })
    }

    fn release(&self, key: &str, token: LeaseToken) -> Result<(), StoreError> {
        self.block(async {
            sqlx::query("DELETE FROM ledger_leases WHERE lock_key = $1 AND token = $2")
                .bind(key)
                .bind(token.0)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("release lease", e))?;
            Ok(())
        })
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23514") | Some("23502") => StoreError::Rejected(msg),
                Some("40001") => StoreError::VersionConflict(msg),
                Some("57014") => StoreError::Timeout(msg),
                _ => StoreError::Rejected(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("connection pool timed out in {operation}"))
        }
        decode @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            StoreError::Corrupt(format!("decode error in {operation}: {decode}"))
        }
        other => StoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}
