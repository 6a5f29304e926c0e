//! Order transaction manager (application-level orchestration).
//!
//! Composes the stock ledger, the item diff engine and the pricing calculator
//! inside store transactions.
//!
//! ## Execution Flow
//!
//! ```text
//! Request
//!   ↓
//! 1. Validate input (no transaction open yet)
//!   ↓
//! 2. Begin one store transaction, lock the order row
//!   ↓
//! 3. Release / allocate stock through the ledger (price snapshot per line)
//!   ↓
//! 4. Write order + item rows with recomputed totals
//!   ↓
//! 5. Commit
//! ```
//!
//! Any error between 2 and 5 drops the transaction uncommitted, which undoes
//! every ledger change made so far. Callers get the error kind and message and
//! resubmit; nothing is retried here.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use stockroom_core::{DomainError, ManagerId, Money, OrderId};
use stockroom_sales::{
    GuestInfo, GuestUpdate, Order, OrderItem, OrderLineRequest, OrderStatus, OrderTotals,
    OrderView, diff_items, item_map, validate_lines,
};

use crate::error::EngineError;
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderLineRequest>,
    pub guest: GuestInfo,
    pub manager_id: ManagerId,
    #[serde(default)]
    pub status: OrderStatus,
    /// Flat amount off the raw total.
    #[serde(default)]
    pub discount: Money,
}

/// Partial update. `None` leaves the field as it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrderRequest {
    pub order_id: OrderId,
    #[serde(default)]
    pub items: Option<Vec<OrderLineRequest>>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub discount: Option<Money>,
    #[serde(default)]
    pub guest: Option<GuestUpdate>,
}

impl UpdateOrderRequest {
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            items: None,
            status: None,
            discount: None,
            guest: None,
        }
    }

    pub fn with_items(mut self, items: Vec<OrderLineRequest>) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_discount(mut self, discount: Money) -> Self {
        self.discount = Some(discount);
        self
    }

    pub fn with_guest(mut self, guest: GuestUpdate) -> Self {
        self.guest = Some(guest);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreateOrderOutcome {
    pub order_id: OrderId,
    pub total_amount: Money,
    pub original_total: Money,
    pub discount: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateOrderOutcome {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// True iff the item set changed and stock was reallocated.
    pub items_updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOrderOutcome {
    pub order_id: OrderId,
    /// Number of item lines whose stock went back to the ledger.
    pub items_restored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusOutcome {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// Atomic create/update/delete/status-change of orders against shared stock.
pub struct OrderTransactionManager<S> {
    store: Arc<S>,
}

impl<S> Clone for OrderTransactionManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> OrderTransactionManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[instrument(
        skip(self, request),
        fields(lines = request.items.len(), manager_id = %request.manager_id),
        err
    )]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<CreateOrderOutcome, EngineError> {
        validate_lines(&request.items)?;
        request.guest.validate()?;

        let order_id = OrderId::new();
        let mut tx = self.store.begin().await?;

        let items = allocate_lines(&mut tx, order_id, &request.items).await?;
        let totals = OrderTotals::for_items(&items, request.discount);
        let order = Order::new(
            order_id,
            request.status,
            request.guest,
            request.manager_id,
            totals,
            Utc::now(),
        );

        tx.insert_order(&order).await?;
        tx.replace_order_items(order_id, &items).await?;
        tx.commit().await?;

        info!(
            order_id = %order_id,
            lines = items.len(),
            total_amount = %totals.total_amount,
            original_total = %totals.original_total,
            "order created"
        );

        Ok(CreateOrderOutcome {
            order_id,
            total_amount: totals.total_amount,
            original_total: totals.original_total,
            discount: totals.discount_amount,
        })
    }

    /// Apply a partial update.
    ///
    /// A new item set that is diff-equal to the current one leaves the ledger
    /// alone. Otherwise every current line is released, every new line is
    /// allocated against the released stock, and the item rows are replaced
    /// with fresh price snapshots; a rejected allocation undoes the release too.
    #[instrument(skip(self, request), fields(order_id = %request.order_id), err)]
    pub async fn update_order(
        &self,
        request: UpdateOrderRequest,
    ) -> Result<UpdateOrderOutcome, EngineError> {
        if let Some(items) = &request.items {
            validate_lines(items)?;
        }

        let order_id = request.order_id;
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .lock_order(order_id)
            .await?
            .ok_or(DomainError::OrderNotFound(order_id))?;
        let original = tx.order_items(order_id).await?;

        let mut touched = false;
        let mut items_updated = false;
        let mut current = original;

        if let Some(requested) = &request.items {
            let diff = diff_items(&item_map(&current), &item_map(requested));
            if diff.is_unchanged() {
                debug!(order_id = %order_id, "item set unchanged, ledger untouched");
            } else {
                release_items(&mut tx, &current).await?;
                let items = allocate_lines(&mut tx, order_id, requested).await?;
                tx.replace_order_items(order_id, &items).await?;

                info!(
                    order_id = %order_id,
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    "order items reallocated"
                );
                current = items;
                items_updated = true;
                touched = true;
            }
        }

        if items_updated || request.discount.is_some() {
            let discount = request.discount.unwrap_or(order.discount_amount);
            order.apply_totals(OrderTotals::for_items(&current, discount));
            touched = true;
        }

        if let Some(status) = request.status {
            order.status = status;
            touched = true;
        }

        if let Some(update) = request.guest.as_ref().filter(|u| !u.is_empty()) {
            order.guest = update.apply_to(&order.guest)?;
            touched = true;
        }

        if touched {
            order.updated_at = Utc::now();
            tx.update_order(&order).await?;
            tx.commit().await?;
            info!(
                order_id = %order_id,
                status = %order.status,
                items_updated,
                total_amount = %order.total_amount,
                "order updated"
            );
        }

        Ok(UpdateOrderOutcome {
            order_id,
            status: order.status,
            items_updated,
        })
    }

    /// Delete an order and return every line's stock to the ledger.
    #[instrument(skip(self), err)]
    pub async fn delete_order(&self, order_id: OrderId) -> Result<DeleteOrderOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        tx.lock_order(order_id)
            .await?
            .ok_or(DomainError::OrderNotFound(order_id))?;

        let items = tx.order_items(order_id).await?;
        release_items(&mut tx, &items).await?;
        tx.delete_order(order_id).await?;
        tx.commit().await?;

        info!(order_id = %order_id, items_restored = items.len(), "order deleted");
        Ok(DeleteOrderOutcome {
            order_id,
            items_restored: items.len(),
        })
    }

    #[instrument(skip(self), err)]
    pub async fn update_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<StatusOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .lock_order(order_id)
            .await?
            .ok_or(DomainError::OrderNotFound(order_id))?;

        if order.status != status {
            order.status = status;
            order.updated_at = Utc::now();
            tx.update_order(&order).await?;
            tx.commit().await?;
            info!(order_id = %order_id, status = %status, "order status changed");
        }

        Ok(StatusOutcome { order_id, status })
    }

    /// Committed order header plus items.
    #[instrument(skip(self), err)]
    pub async fn get_order(&self, order_id: OrderId) -> Result<OrderView, EngineError> {
        let mut tx = self.store.begin().await?;
        let order = tx
            .find_order(order_id)
            .await?
            .ok_or(DomainError::OrderNotFound(order_id))?;
        let items = tx.order_items(order_id).await?;
        Ok(OrderView { order, items })
    }
}

/// Allocate every requested line, snapshotting the product price.
async fn allocate_lines<T: StoreTx>(
    tx: &mut T,
    order_id: OrderId,
    lines: &[OrderLineRequest],
) -> Result<Vec<OrderItem>, EngineError> {
    let mut items = Vec::with_capacity(lines.len());
    for line in lines {
        let product = tx
            .allocate(line.product_id, line.quantity)
            .await
            .inspect_err(|err| {
                warn!(
                    order_id = %order_id,
                    product_id = %line.product_id,
                    requested = line.quantity,
                    kind = err.kind(),
                    error = %err,
                    "allocation rejected"
                );
            })?;

        items.push(OrderItem {
            order_id,
            product_id: line.product_id,
            quantity: line.quantity,
            unit_price: product.price(),
            warranty_months: line.warranty_months,
        });
    }
    Ok(items)
}

async fn release_items<T: StoreTx>(tx: &mut T, items: &[OrderItem]) -> Result<(), EngineError> {
    for item in items {
        tx.release(item.product_id, item.quantity).await?;
    }
    Ok(())
}
