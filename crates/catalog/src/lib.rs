//! Model catalog domain module.
//!
//! The catalog is an ordered list of model archetypes. Replacing it produces a
//! [`PropagationPlan`]: the inventory edits needed to keep existing product
//! rows in line with the new catalog. Pure domain logic (no IO, no storage).

pub mod archetype;
pub mod patch;
pub mod reconcile;

pub use archetype::{ArchetypeInput, Catalog, ModelArchetype};
pub use patch::{ArchetypeRef, ProductPatch, PropagationPlan};
pub use reconcile::{AmbiguousRename, Reconciliation, reconcile};
