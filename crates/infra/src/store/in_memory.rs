//! In-memory store for tests/dev.
//!
//! Transactions are serialized behind one async mutex. A transaction works on
//! a copy of the state and writes it back on commit, so dropping it is a
//! rollback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use stockroom_catalog::{ArchetypeRef, Catalog};
use stockroom_core::{DomainError, OrderId, ProductId};
use stockroom_inventory::{Product, StockLedger};
use stockroom_sales::{Order, OrderItem};

use super::{Store, StoreTx};
use crate::error::EngineError;
use crate::jobs::{
    DeadLetterEntry, JobId, JobStats, JobStore, JobStoreError, PropagationJob,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    products: BTreeMap<ProductId, Product>,
    orders: BTreeMap<OrderId, Order>,
    order_items: BTreeMap<OrderId, Vec<OrderItem>>,
    catalog: Catalog,
    propagated_version: u64,
    jobs: BTreeMap<JobId, PropagationJob>,
    dead_letters: BTreeMap<JobId, DeadLetterEntry>,
}

impl MemoryState {
    /// The job allowed to run next, if any.
    fn queue_head(&self) -> Option<JobId> {
        let head = self
            .jobs
            .values()
            .min_by_key(|j| (j.catalog_version(), j.created_at, j.id))?;
        let blocked = self
            .dead_letters
            .values()
            .any(|d| d.job.catalog_version() < head.catalog_version());
        (!blocked).then_some(head.id)
    }

    fn claim_head(
        &mut self,
        only: Option<JobId>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Option<PropagationJob> {
        let head = self.queue_head()?;
        if only.is_some_and(|id| id != head) {
            return None;
        }
        self.jobs
            .get_mut(&head)
            .filter(|j| j.is_claimable(now))
            .map(|job| lease_job(job, now, lease))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Committed snapshot of one product.
    pub async fn product(&self, id: ProductId) -> Option<Product> {
        self.state.lock().await.products.get(&id).cloned()
    }

    /// Committed snapshot of one order's items.
    pub async fn items_of(&self, order_id: OrderId) -> Vec<OrderItem> {
        self.state
            .lock()
            .await
            .order_items
            .get(&order_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, EngineError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx { guard, working })
    }
}

#[derive(Debug)]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl InMemoryTx {
    fn product_mut(&mut self, id: ProductId) -> Result<&mut Product, EngineError> {
        self.working
            .products
            .get_mut(&id)
            .ok_or_else(|| DomainError::ProductNotFound(id).into())
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn get_product(&mut self, id: ProductId) -> Result<Option<Product>, EngineError> {
        Ok(self.working.products.get(&id).cloned())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), EngineError> {
        let id = product.id_typed();
        if self.working.products.contains_key(&id) {
            return Err(DomainError::conflict(format!("product {id} already exists")).into());
        }
        self.working.products.insert(id, product.clone());
        Ok(())
    }

    async fn allocate(&mut self, id: ProductId, quantity: u32) -> Result<Product, EngineError> {
        let product = self.product_mut(id)?;
        StockLedger::decrement(product, quantity)?;
        Ok(product.clone())
    }

    async fn release(&mut self, id: ProductId, quantity: u32) -> Result<(), EngineError> {
        let product = self.product_mut(id)?;
        StockLedger::increment(product, quantity)?;
        Ok(())
    }

    async fn products_referencing(
        &mut self,
        target: &ArchetypeRef,
    ) -> Result<Vec<Product>, EngineError> {
        Ok(self
            .working
            .products
            .values()
            .filter(|p| target.matches(p))
            .cloned()
            .collect())
    }

    async fn save_product(&mut self, product: &Product) -> Result<(), EngineError> {
        let id = product.id_typed();
        let existing = self.product_mut(id)?;
        if existing.stock() != product.stock() {
            return Err(DomainError::invariant(format!(
                "stock of product {id} changed outside the ledger"
            ))
            .into());
        }
        *existing = product.clone();
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), EngineError> {
        if self.working.orders.contains_key(&order.id) {
            return Err(DomainError::conflict(format!("order {} already exists", order.id)).into());
        }
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>, EngineError> {
        Ok(self.working.orders.get(&id).cloned())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, EngineError> {
        // The whole state is already held exclusively.
        self.find_order(id).await
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), EngineError> {
        match self.working.orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(DomainError::OrderNotFound(order.id).into()),
        }
    }

    async fn delete_order(&mut self, id: OrderId) -> Result<(), EngineError> {
        if self.working.orders.remove(&id).is_none() {
            return Err(DomainError::OrderNotFound(id).into());
        }
        self.working.order_items.remove(&id);
        Ok(())
    }

    async fn order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, EngineError> {
        Ok(self
            .working
            .order_items
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_order_items(
        &mut self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<(), EngineError> {
        if !self.working.orders.contains_key(&order_id) {
            return Err(DomainError::OrderNotFound(order_id).into());
        }
        self.working.order_items.insert(order_id, items.to_vec());
        Ok(())
    }

    async fn load_catalog(&mut self) -> Result<Catalog, EngineError> {
        Ok(self.working.catalog.clone())
    }

    async fn save_catalog(&mut self, catalog: &Catalog) -> Result<(), EngineError> {
        if catalog.version <= self.working.catalog.version {
            return Err(DomainError::conflict(format!(
                "catalog version {} is not newer than {}",
                catalog.version, self.working.catalog.version
            ))
            .into());
        }
        self.working.catalog = catalog.clone();
        Ok(())
    }

    async fn enqueue_job(&mut self, job: &PropagationJob) -> Result<(), EngineError> {
        if self.working.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id).into());
        }
        self.working.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn propagated_version(&mut self) -> Result<u64, EngineError> {
        Ok(self.working.propagated_version)
    }

    async fn complete_job(&mut self, job_id: JobId, catalog_version: u64) -> Result<(), EngineError> {
        self.working
            .jobs
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        let propagated = &mut self.working.propagated_version;
        *propagated = (*propagated).max(catalog_version);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), EngineError> {
        *self.guard = self.working;
        Ok(())
    }
}

fn lease_job(job: &mut PropagationJob, now: DateTime<Utc>, lease: Duration) -> PropagationJob {
    job.mark_running(now, lease);
    job.clone()
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn get_job(&self, job_id: JobId) -> Result<Option<PropagationJob>, JobStoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn update_job(&self, job: &PropagationJob) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<PropagationJob>, JobStoreError> {
        Ok(self.state.lock().await.claim_head(None, now, lease))
    }

    async fn claim(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<PropagationJob>, JobStoreError> {
        Ok(self.state.lock().await.claim_head(Some(job_id), now, lease))
    }

    async fn dead_letter(&self, job: PropagationJob, reason: String) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().await;
        state.jobs.remove(&job.id);
        state
            .dead_letters
            .insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn requeue_dead_letter(&self, job_id: JobId) -> Result<PropagationJob, JobStoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .dead_letters
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.requeue(Utc::now());
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.state.lock().await;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.count(&job.status);
        }
        stats.dead_lettered += state.dead_letters.len();
        Ok(stats)
    }
}
