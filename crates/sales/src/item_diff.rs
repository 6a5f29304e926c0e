//! Item-set diffing for order updates.
//!
//! An update replaces an order's item list. Lines are keyed by product, so
//! the comparison ignores the order in which lines were submitted.

use std::collections::BTreeMap;

use stockroom_core::ProductId;

use crate::order::{OrderItem, OrderLineRequest};

/// Anything that reads like an order line.
pub trait ItemLine {
    fn product_id(&self) -> ProductId;
    fn quantity(&self) -> u32;
    fn warranty_months(&self) -> u16;
}

impl ItemLine for OrderItem {
    fn product_id(&self) -> ProductId {
        self.product_id
    }

    fn quantity(&self) -> u32 {
        self.quantity
    }

    fn warranty_months(&self) -> u16 {
        self.warranty_months
    }
}

impl ItemLine for OrderLineRequest {
    fn product_id(&self) -> ProductId {
        self.product_id
    }

    fn quantity(&self) -> u32 {
        self.quantity
    }

    fn warranty_months(&self) -> u16 {
        self.warranty_months
    }
}

/// The comparable part of a line once keyed by product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub quantity: u32,
    pub warranty_months: u16,
}

pub fn item_map<'a, L: ItemLine + 'a>(
    lines: impl IntoIterator<Item = &'a L>,
) -> BTreeMap<ProductId, ItemKey> {
    lines
        .into_iter()
        .map(|line| {
            (
                line.product_id(),
                ItemKey {
                    quantity: line.quantity(),
                    warranty_months: line.warranty_months(),
                },
            )
        })
        .collect()
}

/// Difference between the stored and the requested item sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDiff {
    pub added: Vec<(ProductId, ItemKey)>,
    pub removed: Vec<(ProductId, ItemKey)>,
    /// `(product, before, after)`
    pub changed: Vec<(ProductId, ItemKey, ItemKey)>,
}

impl ItemDiff {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_items(
    current: &BTreeMap<ProductId, ItemKey>,
    requested: &BTreeMap<ProductId, ItemKey>,
) -> ItemDiff {
    let mut diff = ItemDiff::default();

    for (product_id, before) in current {
        match requested.get(product_id) {
            None => diff.removed.push((*product_id, *before)),
            Some(after) if after != before => diff.changed.push((*product_id, *before, *after)),
            Some(_) => {}
        }
    }
    for (product_id, after) in requested {
        if !current.contains_key(product_id) {
            diff.added.push((*product_id, *after));
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_core::{Money, OrderId};

    fn stored(order_id: OrderId, product_id: ProductId, quantity: u32) -> OrderItem {
        OrderItem {
            order_id,
            product_id,
            quantity,
            unit_price: Money::new(100),
            warranty_months: 12,
        }
    }

    #[test]
    fn same_lines_in_other_order_are_unchanged() {
        let order_id = OrderId::new();
        let (a, b) = (ProductId::new(), ProductId::new());
        let current = vec![stored(order_id, a, 1), stored(order_id, b, 2)];
        let requested = vec![
            OrderLineRequest::new(b, 2).with_warranty(12),
            OrderLineRequest::new(a, 1).with_warranty(12),
        ];

        let diff = diff_items(&item_map(&current), &item_map(&requested));
        assert!(diff.is_unchanged());
    }

    #[test]
    fn warranty_change_counts_as_change() {
        let order_id = OrderId::new();
        let a = ProductId::new();
        let current = vec![stored(order_id, a, 1)];
        let requested = vec![OrderLineRequest::new(a, 1).with_warranty(24)];

        let diff = diff_items(&item_map(&current), &item_map(&requested));
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].2.warranty_months, 24);
    }

    #[test]
    fn reports_added_and_removed_products() {
        let order_id = OrderId::new();
        let (a, b) = (ProductId::new(), ProductId::new());
        let current = vec![stored(order_id, a, 1)];
        let requested = vec![OrderLineRequest::new(b, 3)];

        let diff = diff_items(&item_map(&current), &item_map(&requested));
        assert_eq!(diff.removed, vec![(a, ItemKey { quantity: 1, warranty_months: 12 })]);
        assert_eq!(diff.added, vec![(b, ItemKey { quantity: 3, warranty_months: 0 })]);
        assert!(diff.changed.is_empty());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: shuffling the requested lines never changes the diff.
            #[test]
            fn diff_ignores_line_order(
                quantities in proptest::collection::vec((1u32..10, 0u16..36), 1..8),
                seed in any::<u64>()
            ) {
                let lines: Vec<OrderLineRequest> = quantities
                    .iter()
                    .map(|(qty, months)| OrderLineRequest::new(ProductId::new(), *qty).with_warranty(*months))
                    .collect();

                let mut shuffled = lines.clone();
                let len = shuffled.len();
                shuffled.rotate_left((seed as usize) % len);
                shuffled.reverse();

                let diff = diff_items(&item_map(&lines), &item_map(&shuffled));
                prop_assert!(diff.is_unchanged());
            }
        }
    }
}
