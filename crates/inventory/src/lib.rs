//! Inventory domain module.
//!
//! Products and the stock ledger rules that guard their unsold-unit counter,
//! implemented purely as deterministic domain logic (no IO, no storage).

pub mod ledger;
pub mod product;

pub use ledger::StockLedger;
pub use product::{Product, ProductCategory, StockStatus, StockUnit};
