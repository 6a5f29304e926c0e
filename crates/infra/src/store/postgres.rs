//! Postgres-backed store.
//!
//! Stock changes are single guarded statements (`UPDATE ... WHERE
//! stock_quantity >= $n`), so two transactions allocating the same product
//! can never both succeed past zero. When a guarded statement matches no row
//! the product is re-read and the domain ledger rules decide which error the
//! caller gets.
//!
//! Order update/delete lock the order row (`FOR UPDATE`) for the whole
//! transaction. Catalog replacement locks the `catalog_state` row.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use stockroom_catalog::{ArchetypeRef, Catalog, ModelArchetype, PropagationPlan};
use stockroom_core::{ArchetypeId, DomainError, ManagerId, Money, OrderId, ProductId};
use stockroom_inventory::{Product, StockLedger, StockStatus, StockUnit};
use stockroom_sales::{GuestInfo, Order, OrderItem, OrderStatus};

use super::{Store, StoreTx};
use crate::error::{EngineError, map_sqlx_error};
use crate::jobs::{
    DeadLetterEntry, JobId, JobStats, JobStatus, JobStore, JobStoreError, PropagationJob,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const PRODUCT_COLUMNS: &str = "id, price, category, serial_number, stock_quantity, model, \
                               archetype_id, color, storage, stock_status";

const ORDER_COLUMNS: &str = "id, status, total_amount, original_total, discount_amount, \
                             guest_name, guest_phone, guest_note, guest_embg, guest_id_card, \
                             manager_id, created_at, updated_at";

const JOB_COLUMNS: &str = "id, plan, status, last_error, attempt, created_at, updated_at, \
                           scheduled_at, lease_expires_at";

/// Job row `j` is ready at `$1`: queued past its backoff, or leased and expired.
const CLAIMABLE: &str = "((j.status IN ('pending', 'failed') \
                         AND (j.scheduled_at IS NULL OR j.scheduled_at <= $1)) \
                         OR (j.status = 'running' AND j.lease_expires_at < $1))";

/// No older catalog version is waiting in the dead-letter table.
const NOT_BLOCKED: &str = "NOT EXISTS (SELECT 1 FROM propagation_dead_letters d \
                           WHERE d.catalog_version < j.catalog_version)";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Every statement is idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<Self::Tx, EngineError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PostgresTx { tx })
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn get_product(&mut self, id: ProductId) -> Result<Option<Product>, EngineError> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), EngineError> {
        let serial_number = match product.stock() {
            StockUnit::Serialized { serial_number, .. } => Some(serial_number.as_str()),
            StockUnit::Bulk { .. } => None,
        };

        sqlx::query(&format!(
            "INSERT INTO products ({PRODUCT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(product.id_typed().as_uuid())
        .bind(money_to_db(product.price())?)
        .bind(product.category().as_str())
        .bind(serial_number)
        .bind(count_to_db(product.stock_quantity())?)
        .bind(product.model())
        .bind(product.archetype_id().map(|a| *a.as_uuid()))
        .bind(product.color())
        .bind(product.storage())
        .bind(product.status().as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn allocate(&mut self, id: ProductId, quantity: u32) -> Result<Product, EngineError> {
        let qty = count_to_db(quantity)?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity - $2
            WHERE id = $1
              AND stock_status = 'enabled'
              AND stock_quantity >= $2
              AND (category = 'bulk' OR $2 = 1)
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(qty)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("allocate", e))?;

        if let Some(row) = row {
            return product_from_row(&row);
        }

        // Nothing matched: explain why with the ledger rules.
        let product = self
            .get_product(id)
            .await?
            .ok_or(DomainError::ProductNotFound(id))?;
        StockLedger::check_allocation(&product, quantity)?;
        Err(DomainError::conflict(format!("allocation of product {id} was rejected by the store")).into())
    }

    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn release(&mut self, id: ProductId, quantity: u32) -> Result<(), EngineError> {
        let qty = count_to_db(quantity)?;
        let released = sqlx::query(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity + $2
            WHERE id = $1
              AND $2 > 0
              AND (category = 'bulk' OR (stock_quantity = 0 AND $2 = 1))
            "#,
        )
        .bind(id.as_uuid())
        .bind(qty)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("release", e))?
        .rows_affected();

        if released == 1 {
            return Ok(());
        }

        let mut product = self
            .get_product(id)
            .await?
            .ok_or(DomainError::ProductNotFound(id))?;
        StockLedger::increment(&mut product, quantity)?;
        Err(DomainError::conflict(format!("release of product {id} was rejected by the store")).into())
    }

    async fn products_referencing(
        &mut self,
        target: &ArchetypeRef,
    ) -> Result<Vec<Product>, EngineError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PRODUCT_COLUMNS}
            FROM products
            WHERE archetype_id = $1 OR (archetype_id IS NULL AND model = $2)
            ORDER BY id
            FOR UPDATE
            "#
        ))
        .bind(target.id.as_uuid())
        .bind(&target.model)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("products_referencing", e))?;

        rows.iter().map(product_from_row).collect()
    }

    async fn save_product(&mut self, product: &Product) -> Result<(), EngineError> {
        let id = product.id_typed();
        let updated = sqlx::query(
            r#"
            UPDATE products
            SET price = $2, model = $3, archetype_id = $4, color = $5, storage = $6,
                stock_status = $7
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(money_to_db(product.price())?)
        .bind(product.model())
        .bind(product.archetype_id().map(|a| *a.as_uuid()))
        .bind(product.color())
        .bind(product.storage())
        .bind(product.status().as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_product", e))?
        .rows_affected();

        if updated == 0 {
            return Err(DomainError::ProductNotFound(id).into());
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), EngineError> {
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(money_to_db(order.total_amount)?)
        .bind(money_to_db(order.original_total)?)
        .bind(money_to_db(order.discount_amount)?)
        .bind(&order.guest.name)
        .bind(&order.guest.phone)
        .bind(&order.guest.note)
        .bind(&order.guest.embg)
        .bind(&order.guest.id_card)
        .bind(order.manager_id.as_uuid())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;
        Ok(())
    }

    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>, EngineError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_order", e))?;
        row.as_ref().map(order_from_row).transpose()
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_order", e))?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), EngineError> {
        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, total_amount = $3, original_total = $4, discount_amount = $5,
                guest_name = $6, guest_phone = $7, guest_note = $8, guest_embg = $9,
                guest_id_card = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(money_to_db(order.total_amount)?)
        .bind(money_to_db(order.original_total)?)
        .bind(money_to_db(order.discount_amount)?)
        .bind(&order.guest.name)
        .bind(&order.guest.phone)
        .bind(&order.guest.note)
        .bind(&order.guest.embg)
        .bind(&order.guest.id_card)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?
        .rows_affected();

        if updated == 0 {
            return Err(DomainError::OrderNotFound(order.id).into());
        }
        Ok(())
    }

    async fn delete_order(&mut self, id: OrderId) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM order_items WHERE order_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_order_items", e))?;

        let deleted = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_order", e))?
            .rows_affected();

        if deleted == 0 {
            return Err(DomainError::OrderNotFound(id).into());
        }
        Ok(())
    }

    async fn order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, quantity, unit_price, warranty_months
            FROM order_items
            WHERE order_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("order_items", e))?;

        rows.iter().map(order_item_from_row).collect()
    }

    async fn replace_order_items(
        &mut self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM order_items WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_order_items", e))?;

        for (line_no, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items
                    (order_id, line_no, product_id, quantity, unit_price, warranty_months)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order_id.as_uuid())
            .bind(index_to_db(line_no)?)
            .bind(item.product_id.as_uuid())
            .bind(count_to_db(item.quantity)?)
            .bind(money_to_db(item.unit_price)?)
            .bind(i32::from(item.warranty_months))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }
        Ok(())
    }

    async fn load_catalog(&mut self) -> Result<Catalog, EngineError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM catalog_state WHERE id = 1 FOR UPDATE")
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("load_catalog_version", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, name, base_price, storages, colors, condition, subcategory, storage_prices
            FROM catalog_archetypes
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_catalog", e))?;

        let archetypes = rows
            .iter()
            .map(archetype_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let version = u64::try_from(version.unwrap_or(0))
            .map_err(|_| EngineError::storage("negative catalog version"))?;
        Ok(Catalog::new(version, archetypes))
    }

    #[instrument(skip(self, catalog), fields(version = catalog.version, archetypes = catalog.len()), err)]
    async fn save_catalog(&mut self, catalog: &Catalog) -> Result<(), EngineError> {
        let version = i64::try_from(catalog.version)
            .map_err(|_| DomainError::validation("catalog version out of range"))?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM catalog_state WHERE id = 1 FOR UPDATE")
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("save_catalog", e))?;
        if let Some(current) = current {
            if current >= version {
                return Err(DomainError::conflict(format!(
                    "catalog version {version} is not newer than {current}"
                ))
                .into());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO catalog_state (id, version) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version
            "#,
        )
        .bind(version)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_catalog_version", e))?;

        sqlx::query("DELETE FROM catalog_archetypes")
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("save_catalog", e))?;

        for (position, archetype) in catalog.archetypes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO catalog_archetypes
                    (id, position, name, base_price, storages, colors, condition, subcategory,
                     storage_prices)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(archetype.id.as_uuid())
            .bind(index_to_db(position)?)
            .bind(&archetype.name)
            .bind(money_to_db(archetype.base_price)?)
            .bind(&archetype.storages)
            .bind(&archetype.colors)
            .bind(&archetype.condition)
            .bind(&archetype.subcategory)
            .bind(Json(&archetype.storage_prices))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("save_catalog_archetype", e))?;
        }
        Ok(())
    }

    async fn enqueue_job(&mut self, job: &PropagationJob) -> Result<(), EngineError> {
        sqlx::query(&format!(
            "INSERT INTO propagation_jobs ({JOB_COLUMNS}, catalog_version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(job.id.as_uuid())
        .bind(Json(&job.plan))
        .bind(job.status.as_str())
        .bind(job.status.error())
        .bind(count_to_db(job.attempt)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.lease_expires_at)
        .bind(version_to_db(job.catalog_version())?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_job", e))?;
        Ok(())
    }

    async fn propagated_version(&mut self) -> Result<u64, EngineError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT propagated_version FROM catalog_state WHERE id = 1 FOR UPDATE",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("propagated_version", e))?;

        u64::try_from(version.unwrap_or(0))
            .map_err(|_| EngineError::storage("negative propagated catalog version"))
    }

    async fn complete_job(&mut self, job_id: JobId, catalog_version: u64) -> Result<(), EngineError> {
        let deleted = sqlx::query("DELETE FROM propagation_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("complete_job", e))?
            .rows_affected();
        if deleted == 0 {
            return Err(JobStoreError::NotFound(job_id).into());
        }

        sqlx::query(
            r#"
            UPDATE catalog_state
            SET propagated_version = GREATEST(propagated_version, $1)
            WHERE id = 1
            "#,
        )
        .bind(version_to_db(catalog_version)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_propagated_version", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), EngineError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn get_job(&self, job_id: JobId) -> Result<Option<PropagationJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM propagation_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(job_storage)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, job: &PropagationJob) -> Result<(), JobStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE propagation_jobs
            SET status = $2, last_error = $3, attempt = $4, updated_at = $5,
                scheduled_at = $6, lease_expires_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.status.error())
        .bind(i32::try_from(job.attempt).unwrap_or(i32::MAX))
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.lease_expires_at)
        .execute(&self.pool)
        .await
        .map_err(job_storage)?
        .rows_affected();

        if updated == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    /// Only the head of the queue may run. It is locked, never skipped.
    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<PropagationJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE propagation_jobs j
            SET status = 'running', attempt = attempt + 1, lease_expires_at = $2, updated_at = $1
            WHERE j.id = (
                SELECT id FROM propagation_jobs
                ORDER BY catalog_version, created_at, id
                LIMIT 1
                FOR UPDATE
            )
              AND {CLAIMABLE}
              AND {NOT_BLOCKED}
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(lease_deadline(now, lease))
        .fetch_optional(&self.pool)
        .await
        .map_err(job_storage)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<PropagationJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE propagation_jobs j
            SET status = 'running', attempt = attempt + 1, lease_expires_at = $2, updated_at = $1
            WHERE j.id = $3
              AND {CLAIMABLE}
              AND {NOT_BLOCKED}
              AND NOT EXISTS (
                  SELECT 1 FROM propagation_jobs o WHERE o.catalog_version < j.catalog_version
              )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(lease_deadline(now, lease))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(job_storage)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn dead_letter(&self, job: PropagationJob, reason: String) -> Result<(), JobStoreError> {
        let payload = serde_json::to_value(&job)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode job: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(job_storage)?;
        sqlx::query("DELETE FROM propagation_jobs WHERE id = $1")
            .bind(job.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(job_storage)?;
        sqlx::query(
            r#"
            INSERT INTO propagation_dead_letters
                (job_id, catalog_version, job, reason, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE
                SET job = EXCLUDED.job, reason = EXCLUDED.reason,
                    dead_lettered_at = EXCLUDED.dead_lettered_at
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(version_to_db(job.catalog_version()).map_err(|e| JobStoreError::Storage(e.to_string()))?)
        .bind(payload)
        .bind(&reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(job_storage)?;
        tx.commit().await.map_err(job_storage)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job, reason, dead_lettered_at
            FROM propagation_dead_letters
            ORDER BY dead_lettered_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(job_storage)?;

        rows.iter()
            .map(|row| {
                let Json(job): Json<PropagationJob> = row.try_get("job").map_err(job_storage)?;
                Ok(DeadLetterEntry {
                    job,
                    reason: row.try_get("reason").map_err(job_storage)?,
                    dead_lettered_at: row.try_get("dead_lettered_at").map_err(job_storage)?,
                })
            })
            .collect()
    }

    async fn requeue_dead_letter(&self, job_id: JobId) -> Result<PropagationJob, JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(job_storage)?;
        let payload: Option<Json<PropagationJob>> = sqlx::query_scalar(
            "DELETE FROM propagation_dead_letters WHERE job_id = $1 RETURNING job",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(job_storage)?;

        let Some(Json(mut job)) = payload else {
            return Err(JobStoreError::NotFound(job_id));
        };
        job.requeue(Utc::now());

        sqlx::query(&format!(
            "INSERT INTO propagation_jobs ({JOB_COLUMNS}, catalog_version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(job.id.as_uuid())
        .bind(Json(&job.plan))
        .bind(job.status.as_str())
        .bind(job.status.error())
        .bind(0_i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.lease_expires_at)
        .bind(version_to_db(job.catalog_version()).map_err(|e| JobStoreError::Storage(e.to_string()))?)
        .execute(&mut *tx)
        .await
        .map_err(job_storage)?;

        tx.commit().await.map_err(job_storage)?;
        Ok(job)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, last_error, COUNT(*) AS jobs FROM propagation_jobs GROUP BY status, last_error",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(job_storage)?;

        let mut stats = JobStats::default();
        for row in &rows {
            let status = job_status_from_db(
                &row.try_get::<String, _>("status").map_err(job_storage)?,
                row.try_get("last_error").map_err(job_storage)?,
            )?;
            let jobs: i64 = row.try_get("jobs").map_err(job_storage)?;
            for _ in 0..jobs {
                stats.count(&status);
            }
        }

        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM propagation_dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(job_storage)?;
        stats.dead_lettered += usize::try_from(dead).unwrap_or(0);
        Ok(stats)
    }
}

fn job_storage(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(err.to_string())
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

fn money_to_db(amount: Money) -> Result<i64, EngineError> {
    i64::try_from(amount.minor_units())
        .map_err(|_| DomainError::validation(format!("amount {amount} out of range")).into())
}

fn money_from_db(raw: i64) -> Result<Money, EngineError> {
    u64::try_from(raw)
        .map(Money::new)
        .map_err(|_| EngineError::storage(format!("negative amount {raw} in database")))
}

fn version_to_db(version: u64) -> Result<i64, EngineError> {
    i64::try_from(version)
        .map_err(|_| DomainError::validation(format!("catalog version {version} out of range")).into())
}

fn count_to_db(count: u32) -> Result<i32, EngineError> {
    i32::try_from(count)
        .map_err(|_| DomainError::validation(format!("quantity {count} out of range")).into())
}

fn count_from_db(raw: i32) -> Result<u32, EngineError> {
    u32::try_from(raw).map_err(|_| EngineError::storage(format!("negative quantity {raw} in database")))
}

fn index_to_db(index: usize) -> Result<i32, EngineError> {
    i32::try_from(index).map_err(|_| DomainError::validation("too many entries").into())
}

fn product_from_row(row: &PgRow) -> Result<Product, EngineError> {
    let id: Uuid = row.try_get("id")?;
    let category: String = row.try_get("category")?;
    let serial_number: Option<String> = row.try_get("serial_number")?;
    let quantity = count_from_db(row.try_get("stock_quantity")?)?;

    let stock = match category.as_str() {
        "serialized" => StockUnit::Serialized {
            serial_number: serial_number.unwrap_or_default(),
            in_stock: quantity > 0,
        },
        "bulk" => StockUnit::Bulk { quantity },
        other => return Err(EngineError::storage(format!("unknown product category {other}"))),
    };

    let status = match row.try_get::<String, _>("stock_status")?.as_str() {
        "enabled" => StockStatus::Enabled,
        "disabled" => StockStatus::Disabled,
        other => return Err(EngineError::storage(format!("unknown stock status {other}"))),
    };

    let model: String = row.try_get("model")?;
    let mut product = Product::new(
        ProductId::from_uuid(id),
        money_from_db(row.try_get("price")?)?,
        stock,
        model,
    )
    .with_status(status);

    if let Some(archetype) = row.try_get::<Option<Uuid>, _>("archetype_id")? {
        product = product.with_archetype(ArchetypeId::from_uuid(archetype));
    }
    if let Some(color) = row.try_get::<Option<String>, _>("color")? {
        product = product.with_color(color);
    }
    if let Some(storage) = row.try_get::<Option<String>, _>("storage")? {
        product = product.with_storage(storage);
    }
    Ok(product)
}

fn order_from_row(row: &PgRow) -> Result<Order, EngineError> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id")?),
        status: status.parse::<OrderStatus>()?,
        total_amount: money_from_db(row.try_get("total_amount")?)?,
        original_total: money_from_db(row.try_get("original_total")?)?,
        discount_amount: money_from_db(row.try_get("discount_amount")?)?,
        guest: GuestInfo {
            name: row.try_get("guest_name")?,
            phone: row.try_get("guest_phone")?,
            note: row.try_get("guest_note")?,
            embg: row.try_get("guest_embg")?,
            id_card: row.try_get("guest_id_card")?,
        },
        manager_id: ManagerId::from_uuid(row.try_get("manager_id")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_item_from_row(row: &PgRow) -> Result<OrderItem, EngineError> {
    let warranty: i32 = row.try_get("warranty_months")?;
    Ok(OrderItem {
        order_id: OrderId::from_uuid(row.try_get("order_id")?),
        product_id: ProductId::from_uuid(row.try_get("product_id")?),
        quantity: count_from_db(row.try_get("quantity")?)?,
        unit_price: money_from_db(row.try_get("unit_price")?)?,
        warranty_months: u16::try_from(warranty)
            .map_err(|_| EngineError::storage(format!("warranty {warranty} out of range")))?,
    })
}

fn archetype_from_row(row: &PgRow) -> Result<ModelArchetype, EngineError> {
    let Json(storage_prices): Json<BTreeMap<String, Money>> = row.try_get("storage_prices")?;
    Ok(ModelArchetype {
        id: ArchetypeId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        base_price: money_from_db(row.try_get("base_price")?)?,
        storages: row.try_get("storages")?,
        colors: row.try_get("colors")?,
        condition: row.try_get("condition")?,
        subcategory: row.try_get("subcategory")?,
        storage_prices,
    })
}

fn job_status_from_db(status: &str, last_error: Option<String>) -> Result<JobStatus, JobStoreError> {
    let error = last_error.unwrap_or_default();
    match status {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "failed" => Ok(JobStatus::Failed { error }),
        "dead_lettered" => Ok(JobStatus::DeadLettered { error }),
        other => Err(JobStoreError::Storage(format!("unknown job status {other}"))),
    }
}

fn job_from_row(row: &PgRow) -> Result<PropagationJob, JobStoreError> {
    let Json(plan): Json<PropagationPlan> = row.try_get("plan").map_err(job_storage)?;
    let status: String = row.try_get("status").map_err(job_storage)?;
    let attempt: i32 = row.try_get("attempt").map_err(job_storage)?;

    Ok(PropagationJob {
        id: JobId::from_uuid(row.try_get("id").map_err(job_storage)?),
        plan,
        status: job_status_from_db(&status, row.try_get("last_error").map_err(job_storage)?)?,
        attempt: u32::try_from(attempt).unwrap_or(0),
        created_at: row.try_get("created_at").map_err(job_storage)?,
        updated_at: row.try_get("updated_at").map_err(job_storage)?,
        scheduled_at: row.try_get("scheduled_at").map_err(job_storage)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(job_storage)?,
    })
}
