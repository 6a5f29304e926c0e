//! Inventory edits derived from a catalog replacement.
//!
//! Every patch sets absolute values, so applying a plan twice leaves the same
//! rows as applying it once. Workers rely on that to resume a plan after a crash.

use serde::{Deserialize, Serialize};

use stockroom_core::{ArchetypeId, Money};
use stockroom_inventory::Product;

/// Which product rows a patch targets: rows linked to `id`, plus legacy rows
/// (no archetype link) whose model name equals `model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchetypeRef {
    pub id: ArchetypeId,
    pub model: String,
}

impl ArchetypeRef {
    pub fn new(id: ArchetypeId, model: impl Into<String>) -> Self {
        Self {
            id,
            model: model.into(),
        }
    }

    pub fn matches(&self, product: &Product) -> bool {
        product.references(self.id, &self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProductPatch {
    /// Repoint rows at the archetype's new display name.
    RenameModel { target: ArchetypeRef, name: String },
    RenameStorage {
        target: ArchetypeRef,
        from: String,
        to: String,
    },
    /// The storage option was removed from the archetype; clear it on rows.
    ClearStorage { target: ArchetypeRef, value: String },
    RenameColor {
        target: ArchetypeRef,
        from: String,
        to: String,
    },
    ClearColor { target: ArchetypeRef, value: String },
    /// New base price for unsold rows whose storage has no override.
    SetBasePrice {
        target: ArchetypeRef,
        price: Money,
        except_storages: Vec<String>,
    },
    /// New price for unsold rows with this storage.
    SetStoragePrice {
        target: ArchetypeRef,
        storage: String,
        price: Money,
    },
}

impl ProductPatch {
    pub fn target(&self) -> &ArchetypeRef {
        match self {
            ProductPatch::RenameModel { target, .. }
            | ProductPatch::RenameStorage { target, .. }
            | ProductPatch::ClearStorage { target, .. }
            | ProductPatch::RenameColor { target, .. }
            | ProductPatch::ClearColor { target, .. }
            | ProductPatch::SetBasePrice { target, .. }
            | ProductPatch::SetStoragePrice { target, .. } => target,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            ProductPatch::RenameModel { .. } => "rename_model",
            ProductPatch::RenameStorage { .. } => "rename_storage",
            ProductPatch::ClearStorage { .. } => "clear_storage",
            ProductPatch::RenameColor { .. } => "rename_color",
            ProductPatch::ClearColor { .. } => "clear_color",
            ProductPatch::SetBasePrice { .. } => "set_base_price",
            ProductPatch::SetStoragePrice { .. } => "set_storage_price",
        }
    }

    /// Price patches only touch rows that still hold unsold units.
    pub fn is_price_change(&self) -> bool {
        matches!(
            self,
            ProductPatch::SetBasePrice { .. } | ProductPatch::SetStoragePrice { .. }
        )
    }

    /// Apply to one product row. Returns whether the row changed.
    pub fn apply(&self, product: &mut Product) -> bool {
        if !self.target().matches(product) {
            return false;
        }
        if self.is_price_change() && !product.has_unsold_units() {
            return false;
        }

        match self {
            ProductPatch::RenameModel { target, name } => {
                if product.model() == name && product.archetype_id() == Some(target.id) {
                    return false;
                }
                product.rename_model(target.id, name.clone());
                true
            }
            ProductPatch::RenameStorage { from, to, .. } => {
                if product.storage() != Some(from.as_str()) {
                    return false;
                }
                product.set_storage(Some(to.clone()));
                true
            }
            ProductPatch::ClearStorage { value, .. } => {
                if product.storage() != Some(value.as_str()) {
                    return false;
                }
                product.set_storage(None);
                true
            }
            ProductPatch::RenameColor { from, to, .. } => {
                if product.color() != Some(from.as_str()) {
                    return false;
                }
                product.set_color(Some(to.clone()));
                true
            }
            ProductPatch::ClearColor { value, .. } => {
                if product.color() != Some(value.as_str()) {
                    return false;
                }
                product.set_color(None);
                true
            }
            ProductPatch::SetBasePrice {
                price,
                except_storages,
                ..
            } => {
                let overridden = product
                    .storage()
                    .is_some_and(|s| except_storages.iter().any(|e| e == s));
                if overridden || product.price() == *price {
                    return false;
                }
                product.set_price(*price);
                true
            }
            ProductPatch::SetStoragePrice { storage, price, .. } => {
                if product.storage() != Some(storage.as_str()) || product.price() == *price {
                    return false;
                }
                product.set_price(*price);
                true
            }
        }
    }
}

/// Ordered patches produced by one catalog replacement.
///
/// Renames come first so later patches see the new names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationPlan {
    pub catalog_version: u64,
    pub patches: Vec<ProductPatch>,
}

impl PropagationPlan {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Apply every patch, in order, to a set of rows. Returns the number of
    /// row edits made.
    pub fn apply_all<'a>(&self, products: impl IntoIterator<Item = &'a mut Product>) -> usize {
        let mut edits = 0;
        for product in products {
            for patch in &self.patches {
                if patch.apply(product) {
                    edits += 1;
                }
            }
        }
        edits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_core::ProductId;
    use stockroom_inventory::StockLedger;

    fn target() -> ArchetypeRef {
        ArchetypeRef::new(ArchetypeId::new(), "Phone X")
    }

    fn row(target: &ArchetypeRef) -> Product {
        Product::bulk(ProductId::new(), Money::new(40_000), 3, &target.model)
            .with_archetype(target.id)
            .with_storage("128GB")
            .with_color("Black")
    }

    #[test]
    fn base_price_skips_overridden_storages() {
        let target = target();
        let mut plain = row(&target);
        let mut overridden = row(&target).with_storage("256GB");
        let patch = ProductPatch::SetBasePrice {
            target: target.clone(),
            price: Money::new(42_000),
            except_storages: vec!["256GB".to_string()],
        };

        assert!(patch.apply(&mut plain));
        assert!(!patch.apply(&mut overridden));
        assert_eq!(plain.price(), Money::new(42_000));
        assert_eq!(overridden.price(), Money::new(40_000));
    }

    #[test]
    fn price_patches_skip_sold_out_rows() {
        let target = target();
        let mut sold = Product::serialized(ProductId::new(), Money::new(40_000), "SN", "Phone X")
            .with_archetype(target.id);
        StockLedger::decrement(&mut sold, 1).unwrap();

        let patch = ProductPatch::SetBasePrice {
            target,
            price: Money::new(42_000),
            except_storages: vec![],
        };
        assert!(!patch.apply(&mut sold));
        assert_eq!(sold.price(), Money::new(40_000));
    }

    #[test]
    fn renames_apply_to_sold_out_rows() {
        let target = target();
        let mut sold = row(&target);
        StockLedger::decrement(&mut sold, 3).unwrap();

        let patch = ProductPatch::RenameModel {
            target: target.clone(),
            name: "Phone X Pro".to_string(),
        };
        assert!(patch.apply(&mut sold));
        assert_eq!(sold.model(), "Phone X Pro");
    }

    #[test]
    fn clear_storage_only_touches_matching_value() {
        let target = target();
        let mut a = row(&target);
        let mut b = row(&target).with_storage("512GB");
        let patch = ProductPatch::ClearStorage {
            target,
            value: "128GB".to_string(),
        };

        assert!(patch.apply(&mut a));
        assert!(!patch.apply(&mut b));
        assert_eq!(a.storage(), None);
        assert_eq!(b.storage(), Some("512GB"));
    }

    #[test]
    fn patches_ignore_other_archetypes() {
        let target = target();
        let mut other = Product::bulk(ProductId::new(), Money::new(1), 1, "Phone Y")
            .with_archetype(ArchetypeId::new());
        let patch = ProductPatch::RenameColor {
            target,
            from: "Black".to_string(),
            to: "Midnight".to_string(),
        };
        assert!(!patch.apply(&mut other));
    }

    #[test]
    fn reapplying_a_plan_changes_nothing() {
        let target = target();
        let mut rows = vec![row(&target), row(&target).with_color("White")];
        let plan = PropagationPlan {
            catalog_version: 2,
            patches: vec![
                ProductPatch::RenameModel {
                    target: target.clone(),
                    name: "Phone X2".to_string(),
                },
                ProductPatch::RenameColor {
                    target: target.clone(),
                    from: "Black".to_string(),
                    to: "Graphite".to_string(),
                },
                ProductPatch::SetBasePrice {
                    target,
                    price: Money::new(39_000),
                    except_storages: vec![],
                },
            ],
        };

        assert!(plan.apply_all(rows.iter_mut()) > 0);
        let snapshot = rows.clone();
        assert_eq!(plan.apply_all(rows.iter_mut()), 0);
        assert_eq!(rows, snapshot);
    }

    #[test]
    fn patch_serializes_with_op_tag() {
        let patch = ProductPatch::ClearColor {
            target: target(),
            value: "Red".to_string(),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["op"], "clear_color");
        let back: ProductPatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, patch);
    }
}
