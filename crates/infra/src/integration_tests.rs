//! Integration tests for the order and catalog engines.
//!
//! Tests: OrderTransactionManager / CatalogService → InMemoryStore → ledger
//!
//! Verifies:
//! - Stock is conserved across create → update* → delete
//! - Stock never goes negative, and rejected updates leave it untouched
//! - Diff-equal updates never touch the ledger
//! - Totals follow the discount clamp
//! - Catalog edits reach product rows but never item price snapshots

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use proptest::prelude::*;

    use stockroom_catalog::{ArchetypeInput, reconcile};
    use stockroom_core::{ManagerId, Money, OrderId, ProductId};
    use stockroom_inventory::Product;
    use stockroom_sales::{GuestInfo, OrderLineRequest, OrderStatus};

    use crate::catalog_service::{CatalogService, PropagationStatus};
    use crate::jobs::{JobStore, PropagationJob, WorkerConfig};
    use crate::order_manager::{CreateOrderRequest, OrderTransactionManager, UpdateOrderRequest};
    use crate::store::{InMemoryStore, Store, StoreTx};

    const PRICE: u64 = 40_000;

    fn setup() -> (Arc<InMemoryStore>, OrderTransactionManager<InMemoryStore>) {
        let store = InMemoryStore::arc();
        let manager = OrderTransactionManager::new(store.clone());
        (store, manager)
    }

    async fn seed(store: &InMemoryStore, products: &[Product]) {
        let mut tx = store.begin().await.unwrap();
        for product in products {
            tx.insert_product(product).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    async fn stock(store: &InMemoryStore, id: ProductId) -> u32 {
        store.product(id).await.unwrap().stock_quantity()
    }

    fn order_of(lines: Vec<OrderLineRequest>, discount: u64) -> CreateOrderRequest {
        CreateOrderRequest {
            items: lines,
            guest: GuestInfo::new("Marko", "070 123 456"),
            manager_id: ManagerId::new(),
            status: OrderStatus::Pending,
            discount: Money::new(discount),
        }
    }

    /// Product P with stock 5 and an order holding 2×P.
    async fn order_holding_two() -> (
        Arc<InMemoryStore>,
        OrderTransactionManager<InMemoryStore>,
        ProductId,
        OrderId,
    ) {
        let (store, manager) = setup();
        let product = Product::bulk(ProductId::new(), Money::new(PRICE), 5, "X");
        let pid = product.id_typed();
        seed(&store, &[product]).await;

        let created = manager
            .create_order(order_of(vec![OrderLineRequest::new(pid, 2)], 0))
            .await
            .unwrap();
        (store, manager, pid, created.order_id)
    }

    #[tokio::test]
    async fn create_allocates_stock() {
        let (store, manager, pid, order_id) = order_holding_two().await;

        assert_eq!(stock(&store, pid).await, 3);
        let view = manager.get_order(order_id).await.unwrap();
        assert_eq!(view.order.total_amount, Money::new(2 * PRICE));
        assert_eq!(view.order.original_total, Money::new(2 * PRICE));
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].unit_price, Money::new(PRICE));
    }

    #[tokio::test]
    async fn update_releases_then_reallocates() {
        let (store, manager, pid, order_id) = order_holding_two().await;

        let outcome = manager
            .update_order(
                UpdateOrderRequest::new(order_id).with_items(vec![OrderLineRequest::new(pid, 4)]),
            )
            .await
            .unwrap();
        assert!(outcome.items_updated);

        assert_eq!(stock(&store, pid).await, 1);
        let view = manager.get_order(order_id).await.unwrap();
        assert_eq!(view.order.total_amount, Money::new(4 * PRICE));
        assert_eq!(view.items[0].quantity, 4);
    }

    #[tokio::test]
    async fn oversized_update_rolls_back() {
        let (store, manager, pid, order_id) = order_holding_two().await;

        let err = manager
            .update_order(
                UpdateOrderRequest::new(order_id).with_items(vec![OrderLineRequest::new(pid, 6)]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_stock");

        assert_eq!(stock(&store, pid).await, 3);
        let view = manager.get_order(order_id).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].quantity, 2);
        assert_eq!(view.order.total_amount, Money::new(2 * PRICE));
    }

    #[tokio::test]
    async fn delete_restores_stock() {
        let (store, manager, pid, order_id) = order_holding_two().await;
        manager
            .update_order(
                UpdateOrderRequest::new(order_id).with_items(vec![OrderLineRequest::new(pid, 4)]),
            )
            .await
            .unwrap();

        let outcome = manager.delete_order(order_id).await.unwrap();
        assert_eq!(outcome.items_restored, 1);
        assert_eq!(stock(&store, pid).await, 5);
        assert!(store.items_of(order_id).await.is_empty());
        assert_eq!(
            manager.get_order(order_id).await.unwrap_err().kind(),
            "order_not_found"
        );
    }

    #[tokio::test]
    async fn catalog_price_reaches_rows_not_snapshots() {
        let (store, manager) = setup();
        let catalog = CatalogService::with_config(store.clone(), WorkerConfig::default());

        let x = ArchetypeInput {
            id: None,
            name: "X".to_string(),
            base_price: Money::new(40_000),
            storages: vec!["128GB".to_string()],
            colors: vec!["Black".to_string()],
            condition: "new".to_string(),
            subcategory: "phones".to_string(),
            storage_prices: BTreeMap::new(),
        };
        catalog.replace_catalog(vec![x]).await.unwrap();
        let archetype = catalog.catalog().await.unwrap().archetypes[0].clone();

        let linked = Product::bulk(ProductId::new(), Money::new(40_000), 3, "X")
            .with_archetype(archetype.id)
            .with_storage("128GB");
        let legacy = Product::serialized(ProductId::new(), Money::new(40_000), "SN-77", "X");
        let other = Product::bulk(ProductId::new(), Money::new(40_000), 3, "Y");
        seed(&store, &[linked.clone(), legacy.clone(), other.clone()]).await;

        let created = manager
            .create_order(order_of(vec![OrderLineRequest::new(linked.id_typed(), 1)], 0))
            .await
            .unwrap();

        let mut repriced = ArchetypeInput::from(archetype);
        repriced.base_price = Money::new(42_000);
        let replaced = catalog.replace_catalog(vec![repriced]).await.unwrap();
        assert_eq!(replaced.propagation, PropagationStatus::Applied { edits: 2 });

        assert_eq!(store.product(linked.id_typed()).await.unwrap().price(), Money::new(42_000));
        assert_eq!(store.product(legacy.id_typed()).await.unwrap().price(), Money::new(42_000));
        assert_eq!(store.product(other.id_typed()).await.unwrap().price(), Money::new(40_000));

        let view = manager.get_order(created.order_id).await.unwrap();
        assert_eq!(view.items[0].unit_price, Money::new(40_000));
        assert_eq!(view.order.total_amount, Money::new(40_000));

        assert!(store.get_job(replaced.job_id.unwrap()).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn unpropagated_catalog_never_overwrites_a_newer_one() {
        let (store, _) = setup();
        let catalog = CatalogService::with_config(store.clone(), WorkerConfig::default());

        let x = ArchetypeInput {
            id: None,
            name: "X".to_string(),
            base_price: Money::new(40_000),
            storages: vec!["128GB".to_string()],
            colors: vec!["Black".to_string()],
            condition: "new".to_string(),
            subcategory: "phones".to_string(),
            storage_prices: BTreeMap::new(),
        };
        catalog.replace_catalog(vec![x]).await.unwrap();
        let v1 = catalog.catalog().await.unwrap().archetypes[0].clone();

        let row = Product::bulk(ProductId::new(), Money::new(40_000), 3, "X")
            .with_archetype(v1.id)
            .with_storage("128GB");
        seed(&store, &[row.clone()]).await;

        // v2 commits with its job but nobody applies it yet.
        let mut x2 = ArchetypeInput::from(v1);
        x2.name = "X2".to_string();
        x2.base_price = Money::new(41_000);
        let mut tx = store.begin().await.unwrap();
        let current = tx.load_catalog().await.unwrap();
        let v2 = reconcile(&current, vec![x2]).unwrap();
        assert_eq!(v2.plan.catalog_version, 2);
        tx.save_catalog(&v2.catalog).await.unwrap();
        let v2_job = PropagationJob::new(v2.plan);
        tx.enqueue_job(&v2_job).await.unwrap();
        tx.commit().await.unwrap();

        let mut x3 = ArchetypeInput::from(v2.catalog.archetypes[0].clone());
        x3.name = "X3".to_string();
        x3.base_price = Money::new(42_000);
        let replaced = catalog.replace_catalog(vec![x3]).await.unwrap();
        assert_eq!(replaced.version, 3);
        assert!(matches!(replaced.propagation, PropagationStatus::Deferred { .. }));

        assert_eq!(catalog.worker().drain().await.unwrap(), 2);

        let row = store.product(row.id_typed()).await.unwrap();
        assert_eq!(row.model(), "X3");
        assert_eq!(row.price(), Money::new(42_000));
        assert!(store.get_job(v2_job.id).await.unwrap().is_none());
        assert!(store.get_job(replaced.job_id.unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discount_clamps_to_zero() {
        let (store, manager) = setup();
        let product = Product::bulk(ProductId::new(), Money::new(400), 5, "Cable");
        seed(&store, &[product.clone()]).await;

        let created = manager
            .create_order(order_of(vec![OrderLineRequest::new(product.id_typed(), 2)], 1_000))
            .await
            .unwrap();
        assert_eq!(created.original_total, Money::new(800));
        assert_eq!(created.total_amount, Money::ZERO);
        assert_eq!(created.discount, Money::new(1_000));
    }

    #[tokio::test]
    async fn diff_equal_update_is_a_ledger_no_op() {
        let (store, manager) = setup();
        let a = Product::bulk(ProductId::new(), Money::new(100), 5, "A");
        let b = Product::bulk(ProductId::new(), Money::new(200), 5, "B");
        seed(&store, &[a.clone(), b.clone()]).await;

        let created = manager
            .create_order(order_of(
                vec![
                    OrderLineRequest::new(a.id_typed(), 1),
                    OrderLineRequest::new(b.id_typed(), 2).with_warranty(6),
                ],
                0,
            ))
            .await
            .unwrap();

        // Same set, different order, plus a status change.
        let outcome = manager
            .update_order(
                UpdateOrderRequest::new(created.order_id)
                    .with_items(vec![
                        OrderLineRequest::new(b.id_typed(), 2).with_warranty(6),
                        OrderLineRequest::new(a.id_typed(), 1),
                    ])
                    .with_status(OrderStatus::Completed),
            )
            .await
            .unwrap();

        assert!(!outcome.items_updated);
        assert_eq!(outcome.status, OrderStatus::Completed);
        assert_eq!(stock(&store, a.id_typed()).await, 4);
        assert_eq!(stock(&store, b.id_typed()).await, 3);
    }

    #[tokio::test]
    async fn warranty_change_counts_as_item_change() {
        let (store, manager, pid, order_id) = order_holding_two().await;

        let outcome = manager
            .update_order(UpdateOrderRequest::new(order_id).with_items(vec![
                OrderLineRequest::new(pid, 2).with_warranty(24),
            ]))
            .await
            .unwrap();
        assert!(outcome.items_updated);
        assert_eq!(stock(&store, pid).await, 3);
        assert_eq!(store.items_of(order_id).await[0].warranty_months, 24);
    }

    #[tokio::test]
    async fn partial_reallocation_failure_restores_every_product() {
        let (store, manager) = setup();
        let a = Product::bulk(ProductId::new(), Money::new(100), 5, "A");
        let b = Product::bulk(ProductId::new(), Money::new(100), 1, "B");
        seed(&store, &[a.clone(), b.clone()]).await;

        let created = manager
            .create_order(order_of(vec![OrderLineRequest::new(a.id_typed(), 3)], 0))
            .await
            .unwrap();

        // A reallocates fine; B cannot.
        let err = manager
            .update_order(UpdateOrderRequest::new(created.order_id).with_items(vec![
                OrderLineRequest::new(a.id_typed(), 1),
                OrderLineRequest::new(b.id_typed(), 2),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_stock");

        assert_eq!(stock(&store, a.id_typed()).await, 2);
        assert_eq!(stock(&store, b.id_typed()).await, 1);
        let items = store.items_of(created.order_id).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 3);
    }

    #[tokio::test]
    async fn serialized_unit_moves_between_orders() {
        let (store, manager) = setup();
        let phone = Product::serialized(ProductId::new(), Money::new(50_000), "SN-1", "Phone");
        seed(&store, &[phone.clone()]).await;

        let first = manager
            .create_order(order_of(vec![OrderLineRequest::new(phone.id_typed(), 1)], 0))
            .await
            .unwrap();
        let err = manager
            .create_order(order_of(vec![OrderLineRequest::new(phone.id_typed(), 1)], 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_stock");

        manager.delete_order(first.order_id).await.unwrap();
        manager
            .create_order(order_of(vec![OrderLineRequest::new(phone.id_typed(), 1)], 0))
            .await
            .unwrap();
        assert_eq!(stock(&store, phone.id_typed()).await, 0);
    }

    #[tokio::test]
    async fn concurrent_orders_never_oversell() {
        let (store, manager) = setup();
        let product = Product::bulk(ProductId::new(), Money::new(100), 10, "Cable");
        let pid = product.id_typed();
        seed(&store, &[product]).await;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .create_order(order_of(vec![OrderLineRequest::new(pid, 1)], 0))
                    .await
                    .is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 10);
        assert_eq!(stock(&store, pid).await, 0);
    }

    /// One step applied to the single order under test.
    #[derive(Debug, Clone)]
    enum Step {
        Update(Vec<(usize, u32)>),
        Discount(u64),
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            proptest::collection::vec((0usize..3, 1u32..5), 1..3).prop_map(Step::Update),
            (0u64..2_000).prop_map(Step::Discount),
        ]
    }

    fn lines(ids: &[ProductId], picks: &[(usize, u32)]) -> Vec<OrderLineRequest> {
        let mut seen = Vec::new();
        picks
            .iter()
            .filter(|(idx, _)| {
                let fresh = !seen.contains(idx);
                seen.push(*idx);
                fresh
            })
            .map(|&(idx, qty)| OrderLineRequest::new(ids[idx], qty))
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Run create → update* → delete and check the ledger
        /// and the totals after every step.
        #[test]
        fn order_lifecycle_conserves_stock(
            initial in proptest::collection::vec(1u32..6, 3),
            first in proptest::collection::vec((0usize..3, 1u32..4), 1..3),
            steps in proptest::collection::vec(step_strategy(), 0..6),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async move {
                let (store, manager) = setup();
                let products: Vec<Product> = initial
                    .iter()
                    .enumerate()
                    .map(|(i, &qty)| {
                        Product::bulk(ProductId::new(), Money::new(100 * (i as u64 + 1)), qty, "P")
                    })
                    .collect();
                let ids: Vec<ProductId> = products.iter().map(Product::id_typed).collect();
                seed(&store, &products).await;

                let Ok(created) = manager.create_order(order_of(lines(&ids, &first), 0)).await else {
                    for (id, &qty) in ids.iter().zip(&initial) {
                        prop_assert_eq!(stock(&store, *id).await, qty);
                    }
                    return Ok(());
                };

                for step in steps {
                    let mut before = Vec::new();
                    for id in &ids {
                        before.push(stock(&store, *id).await);
                    }

                    let request = match step {
                        Step::Update(picks) => UpdateOrderRequest::new(created.order_id)
                            .with_items(lines(&ids, &picks)),
                        Step::Discount(amount) => UpdateOrderRequest::new(created.order_id)
                            .with_discount(Money::new(amount)),
                    };
                    let result = manager.update_order(request).await;

                    for (i, id) in ids.iter().enumerate() {
                        let now = stock(&store, *id).await;
                        if result.is_err() {
                            prop_assert_eq!(now, before[i]);
                        }
                        let held: u32 = store
                            .items_of(created.order_id)
                            .await
                            .iter()
                            .filter(|item| item.product_id == *id)
                            .map(|item| item.quantity)
                            .sum();
                        prop_assert_eq!(now + held, initial[i]);
                    }

                    let view = manager.get_order(created.order_id).await.unwrap();
                    let raw: Money = view.items.iter().map(|i| i.line_total()).sum();
                    prop_assert_eq!(view.order.original_total, raw);
                    prop_assert_eq!(
                        view.order.total_amount,
                        raw.saturating_sub(view.order.discount_amount)
                    );
                }

                manager.delete_order(created.order_id).await.unwrap();
                for (id, &qty) in ids.iter().zip(&initial) {
                    prop_assert_eq!(stock(&store, *id).await, qty);
                }
                Ok(())
            })?;
        }
    }
}
