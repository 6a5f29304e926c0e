//! Sales orders domain module.
//!
//! Orders and their item lines, the item diff engine that decides whether an
//! edit changes allocation, and the pricing/discount calculator. Pure,
//! deterministic domain logic (no IO, no storage).

pub mod item_diff;
pub mod order;
pub mod pricing;

pub use item_diff::{ItemDiff, ItemKey, ItemLine, diff_items, item_map};
pub use order::{
    GuestInfo, GuestUpdate, Order, OrderItem, OrderLineRequest, OrderStatus, OrderView,
    validate_lines,
};
pub use pricing::{OrderTotals, raw_total};
