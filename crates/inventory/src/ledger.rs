//! Stock ledger rules: allocation (decrement) and release (increment).
//!
//! These are the checks every store runs inside the transaction that serves
//! an order operation. Stores with a native guarded update (Postgres) use
//! [`StockLedger::check_allocation`] only to classify a rejected update.

use stockroom_core::{DomainError, DomainResult};

use crate::product::{Product, StockUnit};

/// Stateless rules over a product's unsold-unit counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct StockLedger;

impl StockLedger {
    /// Validate that `quantity` units of `product` can be allocated right now.
    pub fn check_allocation(product: &Product, quantity: u32) -> DomainResult<()> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if !product.is_enabled() {
            return Err(DomainError::ProductUnavailable(product.id_typed()));
        }
        if matches!(product.stock(), StockUnit::Serialized { .. }) && quantity != 1 {
            return Err(DomainError::validation(format!(
                "serialized product {} can only be ordered with quantity 1",
                product.id_typed()
            )));
        }

        let available = product.stock_quantity();
        if quantity > available {
            return Err(DomainError::InsufficientStock {
                product_id: product.id_typed(),
                requested: quantity,
                available,
            });
        }
        Ok(())
    }

    /// Allocate `quantity` units. Returns the remaining stock.
    pub fn decrement(product: &mut Product, quantity: u32) -> DomainResult<u32> {
        Self::check_allocation(product, quantity)?;

        match product.stock_mut() {
            StockUnit::Serialized { in_stock, .. } => *in_stock = false,
            StockUnit::Bulk { quantity: on_hand } => *on_hand -= quantity,
        }
        Ok(product.stock_quantity())
    }

    /// Release `quantity` previously allocated units. Returns the new stock.
    ///
    /// Bulk counters have no upper bound. A serialized unit that is already
    /// on the shelf cannot be released again.
    pub fn increment(product: &mut Product, quantity: u32) -> DomainResult<u32> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        let product_id = product.id_typed();

        match product.stock_mut() {
            StockUnit::Serialized { in_stock, .. } => {
                if quantity != 1 {
                    return Err(DomainError::validation(format!(
                        "serialized product {product_id} can only be released with quantity 1"
                    )));
                }
                if *in_stock {
                    return Err(DomainError::invariant(format!(
                        "serialized product {product_id} is already in stock"
                    )));
                }
                *in_stock = true;
            }
            StockUnit::Bulk { quantity: on_hand } => {
                *on_hand = on_hand.checked_add(quantity).ok_or_else(|| {
                    DomainError::invariant(format!("stock counter overflow for {product_id}"))
                })?;
            }
        }
        Ok(product.stock_quantity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::StockStatus;
    use stockroom_core::{Money, ProductId};

    fn bulk(quantity: u32) -> Product {
        Product::bulk(ProductId::new(), Money::new(40_000), quantity, "Charger")
    }

    #[test]
    fn decrement_lowers_stock() {
        let mut product = bulk(5);
        assert_eq!(StockLedger::decrement(&mut product, 2).unwrap(), 3);
        assert_eq!(product.stock_quantity(), 3);
    }

    #[test]
    fn decrement_rejects_more_than_available() {
        let mut product = bulk(5);
        let err = StockLedger::decrement(&mut product, 6).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                product_id: product.id_typed(),
                requested: 6,
                available: 5,
            }
        );
        assert_eq!(product.stock_quantity(), 5);
    }

    #[test]
    fn decrement_rejects_disabled_product() {
        let mut product = bulk(5).with_status(StockStatus::Disabled);
        let err = StockLedger::decrement(&mut product, 1).unwrap_err();
        assert!(matches!(err, DomainError::ProductUnavailable(_)));
    }

    #[test]
    fn decrement_rejects_zero_quantity() {
        let mut product = bulk(5);
        let err = StockLedger::decrement(&mut product, 0).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn serialized_unit_allocates_once() {
        let mut phone = Product::serialized(ProductId::new(), Money::new(1), "SN-1", "Phone");
        assert!(matches!(
            StockLedger::decrement(&mut phone, 2),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(StockLedger::decrement(&mut phone, 1).unwrap(), 0);
        assert!(matches!(
            StockLedger::decrement(&mut phone, 1),
            Err(DomainError::InsufficientStock { available: 0, .. })
        ));
    }

    #[test]
    fn serialized_unit_cannot_be_released_twice() {
        let mut phone = Product::serialized(ProductId::new(), Money::new(1), "SN-1", "Phone");
        StockLedger::decrement(&mut phone, 1).unwrap();
        assert_eq!(StockLedger::increment(&mut phone, 1).unwrap(), 1);

        let err = StockLedger::increment(&mut phone, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn bulk_increment_has_no_upper_bound() {
        let mut product = bulk(0);
        assert_eq!(StockLedger::increment(&mut product, 10).unwrap(), 10);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: no sequence of ledger operations drives stock below zero,
            /// and a rejected decrement leaves stock untouched.
            #[test]
            fn stock_never_negative(
                start in 0u32..20,
                ops in proptest::collection::vec((any::<bool>(), 1u32..8), 0..40)
            ) {
                let mut product = bulk(start);
                let mut expected = i64::from(start);

                for (allocate, qty) in ops {
                    if allocate {
                        let before = product.stock_quantity();
                        match StockLedger::decrement(&mut product, qty) {
                            Ok(_) => expected -= i64::from(qty),
                            Err(_) => prop_assert_eq!(product.stock_quantity(), before),
                        }
                    } else {
                        StockLedger::increment(&mut product, qty).unwrap();
                        expected += i64::from(qty);
                    }
                    prop_assert!(expected >= 0);
                    prop_assert_eq!(i64::from(product.stock_quantity()), expected);
                }
            }
        }
    }
}
