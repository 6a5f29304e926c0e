//! Transactional storage seam.
//!
//! Every mutating engine operation runs inside exactly one [`StoreTx`]. A
//! transaction that is dropped without [`StoreTx::commit`] rolls back every
//! write it performed, including ledger changes.

use async_trait::async_trait;

use stockroom_catalog::{ArchetypeRef, Catalog};
use stockroom_core::{OrderId, ProductId};
use stockroom_inventory::Product;
use stockroom_sales::{Order, OrderItem};

use crate::error::EngineError;
use crate::jobs::{JobId, PropagationJob};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryStore, InMemoryTx};
pub use postgres::{PostgresStore, PostgresTx};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self) -> Result<Self::Tx, EngineError>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn get_product(&mut self, id: ProductId) -> Result<Option<Product>, EngineError>;

    async fn insert_product(&mut self, product: &Product) -> Result<(), EngineError>;

    /// Guarded decrement: take `quantity` units iff the product is enabled
    /// and has at least that many. Returns the product after the decrement,
    /// whose price is the snapshot for the order line.
    async fn allocate(&mut self, id: ProductId, quantity: u32) -> Result<Product, EngineError>;

    /// Return `quantity` previously allocated units.
    async fn release(&mut self, id: ProductId, quantity: u32) -> Result<(), EngineError>;

    /// Rows a catalog patch may touch, locked for the rest of the transaction.
    async fn products_referencing(
        &mut self,
        target: &ArchetypeRef,
    ) -> Result<Vec<Product>, EngineError>;

    /// Persist catalog-managed fields (price, model link, color, storage,
    /// status). Stock only changes through `allocate`/`release`.
    async fn save_product(&mut self, product: &Product) -> Result<(), EngineError>;

    async fn insert_order(&mut self, order: &Order) -> Result<(), EngineError>;

    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>, EngineError>;

    /// Load and lock an order row for the rest of the transaction.
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, EngineError>;

    async fn update_order(&mut self, order: &Order) -> Result<(), EngineError>;

    /// Delete the order row and its items.
    async fn delete_order(&mut self, id: OrderId) -> Result<(), EngineError>;

    async fn order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, EngineError>;

    /// Replace the order's item rows wholesale.
    async fn replace_order_items(
        &mut self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<(), EngineError>;

    async fn load_catalog(&mut self) -> Result<Catalog, EngineError>;

    async fn save_catalog(&mut self, catalog: &Catalog) -> Result<(), EngineError>;

    async fn enqueue_job(&mut self, job: &PropagationJob) -> Result<(), EngineError>;

    /// Highest catalog version whose plan has reached the product rows.
    /// Locked for the rest of the transaction.
    async fn propagated_version(&mut self) -> Result<u64, EngineError>;

    /// Remove a finished job from the outbox and raise the propagated version
    /// to its catalog version, as part of the transaction that applied it.
    async fn complete_job(&mut self, job_id: JobId, catalog_version: u64) -> Result<(), EngineError>;

    async fn commit(self) -> Result<(), EngineError>;
}
