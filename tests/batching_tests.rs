use chrono::{Duration, Utc};
use grocery_dispatch::domain::{
    batching::*, cart::CartItem, dispatch::DispatchEngine, inventory::InventoryRecord, order::*,
    store::Store, types::*,
};
use grocery_dispatch::infrastructure::metrics::{self, MetricsCollector};
use grocery_dispatch::utils::config::{BatchingConfig, EngineConfig};
use rust_decimal_macros::dec;
use std::sync::Arc;

const STORE: GeoPoint = GeoPoint {
    lat: 12.9716,
    lon: 77.5946,
};

fn engine() -> DispatchEngine {
    let engine = DispatchEngine::new(EngineConfig::default(), Arc::new(MetricsCollector::new()));
    engine
        .onboard_store(Store::new(
            StoreId::new("S1"),
            "Fresh Mart Express",
            STORE,
            AreaId::new("downtown"),
            20,
            4.5,
        ))
        .unwrap();
    engine
        .list_inventory(InventoryRecord::new(
            StoreId::new("S1"),
            ProductId::new("milk"),
            Category::new("dairy"),
            Money(dec!(30)),
            100,
            10,
        ))
        .unwrap();
    engine
}

fn place_order(engine: &DispatchEngine, drop: GeoPoint) -> SubOrderId {
    let cart = engine
        .carts()
        .create(CustomerId::new("C1"), AreaId::new("downtown"), DeliveryMode::Instant)
        .unwrap();
    engine
        .carts()
        .add_item(
            &cart.id,
            CartItem {
                product_id: ProductId::new("milk"),
                store_id: None,
                quantity: 1,
            },
        )
        .unwrap();
    let order = engine.assign_cart(&cart.id, drop, Utc::now()).unwrap();
    order.sub_orders[0].id.clone()
}

fn advance(engine: &DispatchEngine, sub: &SubOrderId, to: &[SubOrderStatus]) -> Option<BonusOutcome> {
    let mut bonus = None;
    for status in to {
        bonus = engine
            .update_sub_order_status(sub, *status, None, Utc::now())
            .unwrap()
            .bonus;
    }
    bonus
}

const TO_DELIVERED: [SubOrderStatus; 4] = [
    SubOrderStatus::Preparing,
    SubOrderStatus::Ready,
    SubOrderStatus::PickedUp,
    SubOrderStatus::Delivered,
];

#[test]
fn test_nearby_drops_share_one_rider() {
    let engine = engine();
    engine
        .register_rider(Rider::new(RiderId::new("R1"), STORE, 3))
        .unwrap();
    let a = place_order(&engine, GeoPoint::new(12.9800, 77.6000));
    let b = place_order(&engine, GeoPoint::new(12.9805, 77.6008));

    let report = engine.run_batching_cycle(Utc::now()).unwrap().unwrap();
    assert_eq!(report.assigned, 2);
    assert_eq!(report.groups_formed.len(), 1);

    let group = engine.batching().group(&report.groups_formed[0]).unwrap();
    assert_eq!(group.rider_id, RiderId::new("R1"));
    assert_eq!(group.route.len(), 2);
    assert!(group.distance_saved_km > 0.0);
    assert!(group.route_distance_km > 0.0);

    for sub in [&a, &b] {
        let delivery = engine.batching().delivery_for(sub).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Assigned);
        assert_eq!(delivery.batch_group_id.as_ref(), Some(&group.id));
    }
    assert_eq!(engine.batching().rider(&RiderId::new("R1")).unwrap().assigned, 2);
    assert_eq!(engine.metrics().get_counter(metrics::BATCHES_FORMED), 1);
}

#[test]
fn test_bonus_granted_when_every_member_delivered() {
    let engine = engine();
    engine
        .register_rider(Rider::new(RiderId::new("R1"), STORE, 3))
        .unwrap();
    let a = place_order(&engine, GeoPoint::new(12.9800, 77.6000));
    let b = place_order(&engine, GeoPoint::new(12.9805, 77.6008));
    engine.run_batching_cycle(Utc::now()).unwrap();

    assert_eq!(advance(&engine, &a, &TO_DELIVERED), None);
    let bonus = advance(&engine, &b, &TO_DELIVERED);
    assert!(matches!(
        bonus,
        Some(BonusOutcome::Granted { ref rider, amount, .. })
            if rider == &RiderId::new("R1") && amount == Money(dec!(50))
    ));
    assert_eq!(engine.metrics().get_counter(metrics::BONUSES_GRANTED), 1);
    assert_eq!(engine.batching().rider(&RiderId::new("R1")).unwrap().assigned, 0);
}

#[test]
fn test_one_cancelled_member_forfeits_bonus_for_all() {
    let engine = engine();
    engine
        .register_rider(Rider::new(RiderId::new("R1"), STORE, 3))
        .unwrap();
    let a = place_order(&engine, GeoPoint::new(12.9800, 77.6000));
    let b = place_order(&engine, GeoPoint::new(12.9805, 77.6008));
    engine.run_batching_cycle(Utc::now()).unwrap();

    assert_eq!(advance(&engine, &a, &TO_DELIVERED), None);
    let bonus = advance(&engine, &b, &[SubOrderStatus::Cancelled]);
    assert!(matches!(bonus, Some(BonusOutcome::Forfeited { .. })));
    assert_eq!(engine.metrics().get_counter(metrics::BONUSES_FORFEITED), 1);

    let group = engine
        .batching()
        .delivery_for(&a)
        .unwrap()
        .batch_group_id
        .unwrap();
    assert!(matches!(
        engine.batching().group(&group).unwrap().bonus,
        Some(BonusOutcome::Forfeited { .. })
    ));
}

#[test]
fn test_far_apart_drops_are_not_batched() {
    let engine = engine();
    for (id, cap) in [("R1", 1), ("R2", 1)] {
        engine
            .register_rider(Rider::new(RiderId::new(id), STORE, cap))
            .unwrap();
    }
    place_order(&engine, GeoPoint::new(12.9900, 77.5946));
    place_order(&engine, GeoPoint::new(12.9530, 77.5946));

    let report = engine.run_batching_cycle(Utc::now()).unwrap().unwrap();
    assert_eq!(report.assigned, 2);
    assert!(report.groups_formed.is_empty());
    assert_eq!(engine.batching().idle_riders(), 0);
}

#[test]
fn test_single_slot_riders_split_a_nearby_cluster() {
    let engine = engine();
    for id in ["R1", "R2"] {
        engine
            .register_rider(Rider::new(RiderId::new(id), STORE, 1))
            .unwrap();
    }
    let a = place_order(&engine, GeoPoint::new(12.9800, 77.6000));
    let b = place_order(&engine, GeoPoint::new(12.9805, 77.6008));

    let report = engine.run_batching_cycle(Utc::now()).unwrap().unwrap();
    assert_eq!(report.assigned, 2);
    assert!(report.unmatched.is_empty());
    assert!(report.groups_formed.is_empty());
    assert_eq!(engine.batching().pending_count(), 0);

    let riders: Vec<RiderId> = [&a, &b]
        .iter()
        .map(|sub| engine.batching().delivery_for(sub).unwrap().rider_id.unwrap())
        .collect();
    assert_ne!(riders[0], riders[1]);
    assert_eq!(engine.batching().idle_riders(), 0);
}

#[test]
fn test_without_riders_deliveries_wait_and_time_out() {
    let engine = engine();
    let sub = place_order(&engine, GeoPoint::new(12.9800, 77.6000));

    let later = Utc::now() + Duration::seconds(120);
    let report = engine.run_batching_cycle(later).unwrap().unwrap();
    assert_eq!(report.assigned, 0);
    assert_eq!(report.unmatched.len(), 1);
    assert_eq!(report.timed_out.len(), 1);
    assert_eq!(engine.metrics().get_counter(metrics::BATCHING_TIMEOUTS), 1);
    assert!(engine.batching_due(later).unwrap());

    // A rider coming online picks it up on the next cycle
    engine
        .register_rider(Rider::new(RiderId::new("R1"), STORE, 2))
        .unwrap();
    let report = engine.run_batching_cycle(later).unwrap().unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(
        engine.batching().delivery_for(&sub).unwrap().rider_id,
        Some(RiderId::new("R1"))
    );
}

#[test]
fn test_cancel_while_pending_leaves_the_pool() {
    let engine = engine();
    let sub = place_order(&engine, GeoPoint::new(12.9800, 77.6000));
    assert_eq!(engine.batching().pending_count(), 1);

    engine
        .update_sub_order_status(&sub, SubOrderStatus::Cancelled, None, Utc::now())
        .unwrap();
    assert_eq!(engine.batching().pending_count(), 0);
    assert!(!engine.batching_due(Utc::now()).unwrap());
}

#[test]
fn test_offline_rider_is_skipped() {
    let engine = engine();
    engine
        .register_rider(Rider::new(RiderId::new("R1"), STORE, 3))
        .unwrap();
    engine
        .batching()
        .set_rider_online(&RiderId::new("R1"), false)
        .unwrap();
    place_order(&engine, GeoPoint::new(12.9800, 77.6000));

    let report = engine.run_batching_cycle(Utc::now()).unwrap().unwrap();
    assert_eq!(report.assigned, 0);
    assert_eq!(report.unmatched.len(), 1);
}

#[test]
fn test_form_batches_caps_cluster_size() {
    let now = Utc::now();
    let config = BatchingConfig {
        max_batch_size: 2,
        ..BatchingConfig::default()
    };
    let pending: Vec<Delivery> = (0..3)
        .map(|n| {
            Delivery::new(
                DeliveryId(format!("D{n}")),
                SubOrderId(format!("S{n}")),
                OrderId(format!("O{n}")),
                StoreId::new("S1"),
                STORE,
                GeoPoint::new(12.9800 + f64::from(n) * 0.0002, 77.6000),
                now + Duration::minutes(30 + i64::from(n)),
                now,
            )
        })
        .collect();
    let riders = vec![Rider::new(RiderId::new("R1"), STORE, 3)];

    let plan = form_batches(&pending, &riders, &config);
    // Two-drop batch takes two slots; the third delivery still fits
    assert_eq!(plan.trips.len(), 2);
    assert_eq!(plan.trips[0].route.len(), 2);
    assert_eq!(plan.trips[1].route.len(), 1);
    assert!(plan.unmatched.is_empty());
}
