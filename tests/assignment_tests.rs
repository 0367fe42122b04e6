use chrono::Utc;
use grocery_dispatch::domain::{
    assignment::delivery_fee, cart::CartItem, dispatch::DispatchEngine,
    inventory::InventoryRecord, order::*, store::Store, types::*,
};
use grocery_dispatch::infrastructure::metrics::{self, MetricsCollector};
use grocery_dispatch::utils::config::EngineConfig;
use rust_decimal_macros::dec;
use std::sync::Arc;

const HOME: GeoPoint = GeoPoint {
    lat: 12.9716,
    lon: 77.5946,
};

fn engine() -> DispatchEngine {
    let engine = DispatchEngine::new(EngineConfig::default(), Arc::new(MetricsCollector::new()));
    for (id, name, lat, lon) in [
        ("A", "Fresh Mart Express", 12.9730, 77.5960),
        ("B", "Green Grocery", 12.9690, 77.5920),
    ] {
        engine
            .onboard_store(Store::new(
                StoreId::new(id),
                name,
                GeoPoint::new(lat, lon),
                AreaId::new("downtown"),
                10,
                4.4,
            ))
            .unwrap();
    }
    for (store, product, category, price, available) in [
        ("A", "milk", "dairy", dec!(30), 5),
        ("A", "bread", "bakery", dec!(45), 5),
        ("B", "apples", "produce", dec!(120), 3),
    ] {
        engine
            .list_inventory(InventoryRecord::new(
                StoreId::new(store),
                ProductId::new(product),
                Category::new(category),
                Money(price),
                available,
                2,
            ))
            .unwrap();
    }
    engine
}

fn cart(engine: &DispatchEngine, items: &[(&str, Option<&str>, u32)]) -> CartId {
    let cart = engine
        .carts()
        .create(CustomerId::new("C1"), AreaId::new("downtown"), DeliveryMode::Instant)
        .unwrap();
    for (product, store, quantity) in items {
        engine
            .carts()
            .add_item(
                &cart.id,
                CartItem {
                    product_id: ProductId::new(*product),
                    store_id: store.map(StoreId::new),
                    quantity: *quantity,
                },
            )
            .unwrap();
    }
    cart.id
}

#[test]
fn test_delivery_fee_grows_per_extra_store() {
    let (base, split) = (Money(dec!(40)), Money(dec!(20)));
    assert_eq!(delivery_fee(1, base, split), Money(dec!(40)));
    assert_eq!(delivery_fee(2, base, split), Money(dec!(60)));
    assert_eq!(delivery_fee(3, base, split), Money(dec!(80)));
    for n in 1..10u32 {
        assert_eq!(
            delivery_fee(n as usize, base, split),
            Money(dec!(40) + dec!(20) * rust_decimal::Decimal::from(n - 1))
        );
    }
}

#[test]
fn test_split_cart_creates_one_sub_order_per_store() {
    let engine = engine();
    let id = cart(
        &engine,
        &[("milk", Some("A"), 1), ("bread", Some("A"), 1), ("apples", Some("B"), 1)],
    );
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();

    assert_eq!(order.store_count(), 2);
    assert_eq!(order.delivery_fee, Money(dec!(60)));
    assert_eq!(order.items_total, Money(dec!(195)));
    assert_eq!(order.total, Money(dec!(255)));
    assert!(order.unfulfilled.is_empty());

    for store in ["A", "B"] {
        assert_eq!(engine.store_load(&StoreId::new(store)).unwrap().active_orders, 1);
    }
    assert_eq!(engine.batching().pending_count(), 2);
    assert!(engine.carts().get(&id).is_err());
}

#[test]
fn test_out_of_stock_store_group_does_not_block_the_other() {
    let engine = engine();
    let id = cart(
        &engine,
        &[("milk", Some("A"), 1), ("bread", Some("A"), 1), ("apples", Some("B"), 4)],
    );
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();

    assert_eq!(order.store_count(), 1);
    assert_eq!(order.sub_orders[0].store_id, StoreId::new("A"));
    assert_eq!(order.delivery_fee, Money(dec!(40)));
    assert_eq!(order.unfulfilled.len(), 1);
    assert_eq!(order.unfulfilled[0].kind, "insufficient_stock");

    let apples = engine
        .ledger()
        .record(&StoreId::new("B"), &ProductId::new("apples"))
        .unwrap();
    assert_eq!(apples.reserved, 0);
    assert_eq!(engine.store_load(&StoreId::new("B")).unwrap().active_orders, 0);
    assert_eq!(engine.metrics().get_counter(metrics::GROUPS_REJECTED), 1);
}

#[test]
fn test_unpinned_items_pick_a_stocking_store() {
    let engine = engine();
    let id = cart(&engine, &[("apples", None, 2), ("milk", None, 1)]);
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();

    let stores: Vec<&str> = order.sub_orders.iter().map(|s| s.store_id.as_str()).collect();
    assert_eq!(stores.len(), 2);
    assert!(stores.contains(&"A") && stores.contains(&"B"));
}

#[test]
fn test_unpinned_item_skips_nearer_store_that_cannot_cover_it() {
    let engine = engine();
    for (id, lat, lon, available) in [("N", 12.9716, 77.5946, 2), ("F", 12.9900, 77.6100, 10)] {
        engine
            .onboard_store(Store::new(
                StoreId::new(id),
                id,
                GeoPoint::new(lat, lon),
                AreaId::new("downtown"),
                10,
                4.4,
            ))
            .unwrap();
        engine
            .list_inventory(InventoryRecord::new(
                StoreId::new(id),
                ProductId::new("oat-milk"),
                Category::new("dairy"),
                Money(dec!(90)),
                available,
                1,
            ))
            .unwrap();
    }

    let id = cart(&engine, &[("oat-milk", None, 5)]);
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();
    assert_eq!(order.sub_orders.len(), 1);
    assert_eq!(order.sub_orders[0].store_id, StoreId::new("F"));
    assert!(order.unfulfilled.is_empty());

    let near = engine
        .ledger()
        .record(&StoreId::new("N"), &ProductId::new("oat-milk"))
        .unwrap();
    assert_eq!(near.reserved, 0);

    // More than any single store holds
    let id = cart(&engine, &[("oat-milk", None, 6)]);
    let err = engine.assign_cart(&id, HOME, Utc::now()).unwrap_err();
    assert_eq!(err, DispatchError::NoEligibleStore(ProductId::new("oat-milk")));
}

#[test]
fn test_unknown_product_has_no_eligible_store() {
    let engine = engine();
    let id = cart(&engine, &[("caviar", None, 1)]);
    let err = engine.assign_cart(&id, HOME, Utc::now()).unwrap_err();
    assert!(matches!(err, DispatchError::NoEligibleStore(_)));
    // Nothing reserved, so the customer keeps the cart
    assert!(engine.carts().get(&id).is_ok());
}

#[test]
fn test_far_customer_has_no_eligible_store() {
    let engine = engine();
    let id = cart(&engine, &[("milk", None, 1)]);
    let err = engine
        .assign_cart(&id, GeoPoint::new(13.3, 77.9), Utc::now())
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoEligibleStore(_)));
}

#[test]
fn test_empty_cart_is_invalid() {
    let engine = engine();
    let id = cart(&engine, &[]);
    let err = engine.assign_cart(&id, HOME, Utc::now()).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidCart(_)));
}

#[test]
fn test_deactivated_store_is_not_used() {
    let engine = engine();
    engine.deactivate_store(&StoreId::new("B")).unwrap();
    let id = cart(&engine, &[("apples", None, 1)]);
    let err = engine.assign_cart(&id, HOME, Utc::now()).unwrap_err();
    assert!(matches!(err, DispatchError::NoEligibleStore(_)));
}

#[test]
fn test_state_machine_rejects_skips() {
    let engine = engine();
    let id = cart(&engine, &[("milk", Some("A"), 2)]);
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();
    let sub = order.sub_orders[0].id.clone();

    let err = engine
        .update_sub_order_status(&sub, SubOrderStatus::PickedUp, None, Utc::now())
        .unwrap_err();
    assert!(matches!(err, DispatchError::IllegalStateTransition { .. }));
    assert_eq!(engine.metrics().get_counter(metrics::ILLEGAL_TRANSITIONS), 1);

    for status in [SubOrderStatus::Preparing, SubOrderStatus::Ready, SubOrderStatus::PickedUp] {
        engine
            .update_sub_order_status(&sub, status, None, Utc::now())
            .unwrap();
    }
    let milk = engine
        .ledger()
        .record(&StoreId::new("A"), &ProductId::new("milk"))
        .unwrap();
    assert_eq!((milk.available, milk.reserved), (3, 0));

    // Pickup is past the point of cancellation
    let err = engine
        .update_sub_order_status(&sub, SubOrderStatus::Cancelled, None, Utc::now())
        .unwrap_err();
    assert!(matches!(err, DispatchError::IllegalStateTransition { .. }));

    let update = engine
        .update_sub_order_status(&sub, SubOrderStatus::Delivered, None, Utc::now())
        .unwrap();
    assert_eq!(update.order_status, OrderStatus::Completed);
    assert_eq!(update.sub_order.history.len(), 4);

    let err = engine
        .update_sub_order_status(&sub, SubOrderStatus::Preparing, None, Utc::now())
        .unwrap_err();
    assert!(matches!(err, DispatchError::IllegalStateTransition { .. }));
}

#[test]
fn test_cancellation_returns_stock_and_load() {
    let engine = engine();
    let id = cart(&engine, &[("milk", Some("A"), 2), ("apples", Some("B"), 1)]);
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();
    let to_cancel = order
        .sub_orders
        .iter()
        .find(|s| s.store_id == StoreId::new("A"))
        .unwrap()
        .id
        .clone();

    let op = Some(OperationId::new("cancel-1"));
    let update = engine
        .update_sub_order_status(&to_cancel, SubOrderStatus::Cancelled, op.clone(), Utc::now())
        .unwrap();
    assert_eq!(update.order_status, OrderStatus::Active);

    let replay = engine
        .update_sub_order_status(&to_cancel, SubOrderStatus::Cancelled, op, Utc::now())
        .unwrap();
    assert!(replay.replayed);

    let milk = engine
        .ledger()
        .record(&StoreId::new("A"), &ProductId::new("milk"))
        .unwrap();
    assert_eq!((milk.available, milk.reserved), (5, 0));
    assert_eq!(engine.store_load(&StoreId::new("A")).unwrap().active_orders, 0);
    assert_eq!(engine.store_load(&StoreId::new("B")).unwrap().active_orders, 1);
}

#[test]
fn test_partially_fulfilled_order() {
    let engine = engine();
    let id = cart(&engine, &[("milk", Some("A"), 1), ("apples", Some("B"), 1)]);
    let order = engine.assign_cart(&id, HOME, Utc::now()).unwrap();

    let (a, b) = (&order.sub_orders[0].id, &order.sub_orders[1].id);
    engine
        .update_sub_order_status(a, SubOrderStatus::Cancelled, None, Utc::now())
        .unwrap();
    for status in [
        SubOrderStatus::Preparing,
        SubOrderStatus::Ready,
        SubOrderStatus::PickedUp,
        SubOrderStatus::Delivered,
    ] {
        engine.update_sub_order_status(b, status, None, Utc::now()).unwrap();
    }
    assert_eq!(
        engine.order(&order.id).unwrap().status(),
        OrderStatus::PartiallyFulfilled
    );
}

#[test]
fn test_finished_sub_orders_leave_no_operation_ids_on_the_ledger() {
    let engine = engine();
    let delivered = cart(&engine, &[("milk", Some("A"), 2)]);
    let delivered = engine.assign_cart(&delivered, HOME, Utc::now()).unwrap();
    let cancelled = cart(&engine, &[("milk", Some("A"), 1)]);
    let cancelled = engine.assign_cart(&cancelled, HOME, Utc::now()).unwrap();

    for status in [
        SubOrderStatus::Preparing,
        SubOrderStatus::Ready,
        SubOrderStatus::PickedUp,
        SubOrderStatus::Delivered,
    ] {
        engine
            .update_sub_order_status(&delivered.sub_orders[0].id, status, None, Utc::now())
            .unwrap();
    }
    engine
        .update_sub_order_status(
            &cancelled.sub_orders[0].id,
            SubOrderStatus::Cancelled,
            None,
            Utc::now(),
        )
        .unwrap();

    let milk = engine
        .ledger()
        .record(&StoreId::new("A"), &ProductId::new("milk"))
        .unwrap();
    assert_eq!((milk.available, milk.reserved), (3, 0));
    assert!(milk.applied_ops.is_empty());
}
