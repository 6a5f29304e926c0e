//! Infrastructure layer: transactional stores, the order and catalog engines,
//! the propagation outbox, and configuration.
//!
//! Domain crates decide; this crate runs those decisions inside one store
//! transaction per request.

pub mod catalog_service;
pub mod config;
pub mod error;
pub mod jobs;
pub mod order_manager;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use catalog_service::{CatalogReplaced, CatalogService, PropagationStatus};
pub use config::{ConfigError, EngineConfig, PropagationSettings, StoreKind};
pub use error::EngineError;
pub use jobs::{JobStore, PropagationWorker, WorkerConfig};
pub use order_manager::{
    CreateOrderOutcome, CreateOrderRequest, DeleteOrderOutcome, OrderTransactionManager,
    StatusOutcome, UpdateOrderOutcome, UpdateOrderRequest,
};
pub use store::{InMemoryStore, PostgresStore, Store, StoreTx};
