//! Order totals.
//!
//! The discount is a flat amount. It is stored as requested and only clamped
//! when the total is derived, so an update that raises the item sum can
//! recover a discount that was previously larger than the order.

use serde::{Deserialize, Serialize};

use stockroom_core::Money;

use crate::order::OrderItem;

/// Sum of `unit_price * quantity` across the lines.
pub fn raw_total<'a>(items: impl IntoIterator<Item = &'a OrderItem>) -> Money {
    items.into_iter().map(OrderItem::line_total).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    /// Pre-discount item sum.
    pub original_total: Money,
    /// Discount actually taken off, never more than `original_total`.
    pub applied_discount: Money,
    /// Post-discount total, never negative.
    pub total_amount: Money,
    /// Discount as requested.
    pub discount_amount: Money,
}

impl OrderTotals {
    pub fn compute(raw: Money, discount: Money) -> Self {
        let applied_discount = if discount > raw { raw } else { discount };
        Self {
            original_total: raw,
            applied_discount,
            total_amount: raw.saturating_sub(discount),
            discount_amount: discount,
        }
    }

    pub fn for_items<'a>(items: impl IntoIterator<Item = &'a OrderItem>, discount: Money) -> Self {
        Self::compute(raw_total(items), discount)
    }
}
