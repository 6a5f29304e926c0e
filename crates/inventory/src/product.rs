use serde::{Deserialize, Serialize};

use stockroom_core::{ArchetypeId, Entity, Money, ProductId};

/// How a product's units are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductCategory {
    /// One row per physical unit, identified by a serial number (phones, laptops).
    Serialized,
    /// Interchangeable units counted by an integer (cases, cables).
    Bulk,
}

impl ProductCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductCategory::Serialized => "serialized",
            ProductCategory::Bulk => "bulk",
        }
    }
}

/// Whether the product may be allocated to orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockStatus {
    Enabled,
    Disabled,
}

impl StockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StockStatus::Enabled => "enabled",
            StockStatus::Disabled => "disabled",
        }
    }
}

/// Unsold units held by a product row.
///
/// A serialized unit is either on the shelf or not; it can never hold a count
/// other than 0 or 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StockUnit {
    Serialized { serial_number: String, in_stock: bool },
    Bulk { quantity: u32 },
}

impl StockUnit {
    pub fn category(&self) -> ProductCategory {
        match self {
            StockUnit::Serialized { .. } => ProductCategory::Serialized,
            StockUnit::Bulk { .. } => ProductCategory::Bulk,
        }
    }

    /// Units currently available for allocation.
    pub fn available(&self) -> u32 {
        match self {
            StockUnit::Serialized { in_stock, .. } => u32::from(*in_stock),
            StockUnit::Bulk { quantity } => *quantity,
        }
    }
}

/// A sellable inventory row.
///
/// `model` is the display name of the catalog archetype the row was created
/// from; `archetype_id` is the stable link catalog edits follow. Rows imported
/// before archetypes had ids carry only the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    price: Money,
    stock: StockUnit,
    model: String,
    archetype_id: Option<ArchetypeId>,
    color: Option<String>,
    storage: Option<String>,
    status: StockStatus,
}

impl Product {
    pub fn new(id: ProductId, price: Money, stock: StockUnit, model: impl Into<String>) -> Self {
        Self {
            id,
            price,
            stock,
            model: model.into(),
            archetype_id: None,
            color: None,
            storage: None,
            status: StockStatus::Enabled,
        }
    }

    /// Bulk-counted product with `quantity` units on hand.
    pub fn bulk(id: ProductId, price: Money, quantity: u32, model: impl Into<String>) -> Self {
        Self::new(id, price, StockUnit::Bulk { quantity }, model)
    }

    /// Serialized product, on the shelf.
    pub fn serialized(
        id: ProductId,
        price: Money,
        serial_number: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            price,
            StockUnit::Serialized {
                serial_number: serial_number.into(),
                in_stock: true,
            },
            model,
        )
    }

    pub fn with_archetype(mut self, archetype_id: ArchetypeId) -> Self {
        self.archetype_id = Some(archetype_id);
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    pub fn with_status(mut self, status: StockStatus) -> Self {
        self.status = status;
        self
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn price(&self) -> Money {
        self.price
    }

    pub fn stock(&self) -> &StockUnit {
        &self.stock
    }

    pub(crate) fn stock_mut(&mut self) -> &mut StockUnit {
        &mut self.stock
    }

    pub fn stock_quantity(&self) -> u32 {
        self.stock.available()
    }

    pub fn category(&self) -> ProductCategory {
        self.stock.category()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn archetype_id(&self) -> Option<ArchetypeId> {
        self.archetype_id
    }

    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    pub fn storage(&self) -> Option<&str> {
        self.storage.as_deref()
    }

    pub fn status(&self) -> StockStatus {
        self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.status == StockStatus::Enabled
    }

    /// True while at least one unit is unsold.
    pub fn has_unsold_units(&self) -> bool {
        self.stock_quantity() > 0
    }

    /// Whether this row belongs to the given archetype: by id when linked,
    /// otherwise by exact model name.
    pub fn references(&self, archetype_id: ArchetypeId, model_name: &str) -> bool {
        match self.archetype_id {
            Some(linked) => linked == archetype_id,
            None => self.model == model_name,
        }
    }

    pub fn set_price(&mut self, price: Money) {
        self.price = price;
    }

    /// Repoint the row at a renamed archetype. Legacy rows gain the id link.
    pub fn rename_model(&mut self, archetype_id: ArchetypeId, name: impl Into<String>) {
        self.model = name.into();
        self.archetype_id = Some(archetype_id);
    }

    pub fn set_storage(&mut self, storage: Option<String>) {
        self.storage = storage;
    }

    pub fn set_color(&mut self, color: Option<String>) {
        self.color = color;
    }

    pub fn set_status(&mut self, status: StockStatus) {
        self.status = status;
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
