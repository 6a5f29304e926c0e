use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{DomainError, DomainResult, Entity, ManagerId, Money, OrderId, ProductId};

use crate::pricing::OrderTotals;

/// Order status tag.
///
/// Both states stay editable; `Completed` only records that the sale was
/// handed over, it does not freeze the order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Completed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
        }
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "completed" => Ok(OrderStatus::Completed),
            other => Err(DomainError::validation(format!(
                "status must be one of: pending, completed (got {other})"
            ))),
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Walk-in customer details captured on the order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    pub name: String,
    pub phone: String,
    pub note: Option<String>,
    /// National identification number.
    pub embg: Option<String>,
    pub id_card: Option<String>,
}

impl GuestInfo {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("guest name cannot be empty"));
        }
        if self.phone.trim().is_empty() {
            return Err(DomainError::validation("guest phone cannot be empty"));
        }
        Ok(())
    }
}

/// Partial guest edit. `Some("")` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub note: Option<String>,
    pub embg: Option<String>,
    pub id_card: Option<String>,
}

impl GuestUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.phone.is_none()
            && self.note.is_none()
            && self.embg.is_none()
            && self.id_card.is_none()
    }

    /// Produce the edited guest record, validating the result.
    pub fn apply_to(&self, guest: &GuestInfo) -> DomainResult<GuestInfo> {
        fn optional(edit: &Option<String>, current: &Option<String>) -> Option<String> {
            match edit {
                Some(v) if v.trim().is_empty() => None,
                Some(v) => Some(v.clone()),
                None => current.clone(),
            }
        }

        let updated = GuestInfo {
            name: self.name.clone().unwrap_or_else(|| guest.name.clone()),
            phone: self.phone.clone().unwrap_or_else(|| guest.phone.clone()),
            note: optional(&self.note, &guest.note),
            embg: optional(&self.embg, &guest.embg),
            id_card: optional(&self.id_card, &guest.id_card),
        };
        updated.validate()?;
        Ok(updated)
    }
}

/// A requested order line, before allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    #[serde(default)]
    pub warranty_months: u16,
}

impl OrderLineRequest {
    pub fn new(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            quantity,
            warranty_months: 0,
        }
    }

    pub fn with_warranty(mut self, months: u16) -> Self {
        self.warranty_months = months;
        self
    }
}

/// Validate a requested item set before any transaction opens.
pub fn validate_lines(lines: &[OrderLineRequest]) -> DomainResult<()> {
    if lines.is_empty() {
        return Err(DomainError::validation("order must contain at least one item"));
    }

    let mut seen = HashSet::with_capacity(lines.len());
    for line in lines {
        if line.quantity == 0 {
            return Err(DomainError::validation(format!(
                "quantity must be positive for product {}",
                line.product_id
            )));
        }
        if !seen.insert(line.product_id) {
            return Err(DomainError::validation(format!(
                "product {} appears more than once",
                line.product_id
            )));
        }
    }
    Ok(())
}

/// An allocated order line. `unit_price` is the product price captured at
/// allocation time and never follows later catalog price edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
    pub warranty_months: u16,
}

impl OrderItem {
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// Order header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub status: OrderStatus,
    /// Post-discount total.
    pub total_amount: Money,
    /// Pre-discount sum of the current items.
    pub original_total: Money,
    /// Requested flat discount.
    pub discount_amount: Money,
    pub guest: GuestInfo,
    pub manager_id: ManagerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        id: OrderId,
        status: OrderStatus,
        guest: GuestInfo,
        manager_id: ManagerId,
        totals: OrderTotals,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status,
            total_amount: totals.total_amount,
            original_total: totals.original_total,
            discount_amount: totals.discount_amount,
            guest,
            manager_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_totals(&mut self, totals: OrderTotals) {
        self.total_amount = totals.total_amount;
        self.original_total = totals.original_total;
        self.discount_amount = totals.discount_amount;
    }
}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Order header plus its current items, as read by invoice/report layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Completed".parse::<OrderStatus>().unwrap(), OrderStatus::Completed);
        assert_eq!("pending".parse::<OrderStatus>().unwrap(), OrderStatus::Pending);
        assert!(matches!(
            "shipped".parse::<OrderStatus>(),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn validate_lines_rejects_empty_set() {
        assert!(matches!(validate_lines(&[]), Err(DomainError::Validation(_))));
    }

    #[test]
    fn validate_lines_rejects_zero_quantity() {
        let lines = [OrderLineRequest::new(ProductId::new(), 0)];
        assert!(matches!(validate_lines(&lines), Err(DomainError::Validation(_))));
    }

    #[test]
    fn validate_lines_rejects_duplicate_products() {
        let product = ProductId::new();
        let lines = [
            OrderLineRequest::new(product, 1),
            OrderLineRequest::new(product, 2),
        ];
        let err = validate_lines(&lines).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("more than once")));
    }

    #[test]
    fn guest_update_keeps_untouched_fields() {
        let mut guest = GuestInfo::new("Ana", "070111222");
        guest.note = Some("call first".to_string());

        let update = GuestUpdate {
            phone: Some("070999888".to_string()),
            ..Default::default()
        };
        let updated = update.apply_to(&guest).unwrap();
        assert_eq!(updated.name, "Ana");
        assert_eq!(updated.phone, "070999888");
        assert_eq!(updated.note.as_deref(), Some("call first"));
    }

    #[test]
    fn guest_update_clears_optional_with_blank() {
        let mut guest = GuestInfo::new("Ana", "070111222");
        guest.embg = Some("0101990450001".to_string());

        let update = GuestUpdate {
            embg: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(update.apply_to(&guest).unwrap().embg, None);
    }

    #[test]
    fn guest_update_cannot_blank_required_fields() {
        let guest = GuestInfo::new("Ana", "070111222");
        let update = GuestUpdate {
            name: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(update.apply_to(&guest).is_err());
    }
}
