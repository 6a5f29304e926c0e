//! Domain error model.

use thiserror::Error;

use crate::id::{OrderId, ProductId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// stock availability, missing rows). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input, rejected before any transaction opens.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// Requested quantity exceeds what is available at allocation time.
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// The product exists but is disabled for sale.
    #[error("product unavailable: {0}")]
    ProductUnavailable(ProductId),

    /// A cascade update derived from a catalog edit failed.
    #[error("catalog propagation failed: {0}")]
    CatalogPropagation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A conflict occurred (e.g. concurrent modification detected by the store).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn propagation(msg: impl Into<String>) -> Self {
        Self::CatalogPropagation(msg.into())
    }

    /// Stable machine-readable code for callers.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::ProductNotFound(_) => "product_not_found",
            DomainError::OrderNotFound(_) => "order_not_found",
            DomainError::InsufficientStock { .. } => "insufficient_stock",
            DomainError::ProductUnavailable(_) => "product_unavailable",
            DomainError::CatalogPropagation(_) => "catalog_propagation_error",
            DomainError::InvariantViolation(_) => "invariant_violation",
            DomainError::Conflict(_) => "conflict",
        }
    }
}
