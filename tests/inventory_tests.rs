use grocery_dispatch::domain::{inventory::*, types::*};
use rust_decimal_macros::dec;

fn ledger() -> InventoryLedger {
    let ledger = InventoryLedger::new(64);
    for (product, available, min) in [("milk", 10, 4), ("bread", 5, 2), ("eggs", 0, 6)] {
        ledger
            .upsert(InventoryRecord::new(
                StoreId::new("S1"),
                ProductId::new(product),
                Category::new("dairy"),
                Money(dec!(30)),
                available,
                min,
            ))
            .unwrap();
    }
    ledger
}

fn req(product: &str, quantity: u32) -> ReservationRequest {
    ReservationRequest {
        product_id: ProductId::new(product),
        quantity,
    }
}

fn counts(ledger: &InventoryLedger, product: &str) -> (u32, u32) {
    let record = ledger
        .record(&StoreId::new("S1"), &ProductId::new(product))
        .unwrap();
    (record.available, record.reserved)
}

#[test]
fn test_reserve_commit_release_lifecycle() {
    let ledger = ledger();
    let store = StoreId::new("S1");
    let op = OperationId::new("SUB-000001");

    ledger
        .reserve_group(&store, &[req("milk", 3), req("bread", 2)], &op)
        .unwrap();
    assert_eq!(counts(&ledger, "milk"), (10, 3));
    assert_eq!(counts(&ledger, "bread"), (5, 2));

    ledger
        .commit_group(&store, &[req("milk", 3), req("bread", 2)], &op)
        .unwrap();
    assert_eq!(counts(&ledger, "milk"), (7, 0));
    assert_eq!(counts(&ledger, "bread"), (3, 0));

    let op2 = OperationId::new("SUB-000002");
    ledger.reserve_group(&store, &[req("milk", 4)], &op2).unwrap();
    ledger.release_group(&store, &[req("milk", 4)], &op2).unwrap();
    assert_eq!(counts(&ledger, "milk"), (7, 0));
}

#[test]
fn test_replayed_commit_and_release_have_no_effect() {
    let ledger = ledger();
    let store = StoreId::new("S1");
    let milk = ProductId::new("milk");
    let op = OperationId::new("SUB-000001");

    assert!(ledger.reserve(&store, &milk, 4, &op).unwrap());
    assert!(ledger.commit(&store, &milk, 2, &op).unwrap());
    assert!(!ledger.commit(&store, &milk, 2, &op).unwrap());
    assert_eq!(counts(&ledger, "milk"), (8, 2));

    assert!(ledger.release(&store, &milk, 2, &op).unwrap());
    assert!(!ledger.release(&store, &milk, 2, &op).unwrap());
    assert_eq!(counts(&ledger, "milk"), (8, 0));

    let restock = OperationId::new("restock-7");
    assert!(ledger.restock(&store, &milk, 5, &restock).unwrap());
    assert!(!ledger.restock(&store, &milk, 5, &restock).unwrap());
    assert_eq!(counts(&ledger, "milk"), (13, 0));
}

#[test]
fn test_group_reservation_is_all_or_nothing() {
    let ledger = ledger();
    let err = ledger
        .reserve_group(
            &StoreId::new("S1"),
            &[req("milk", 2), req("bread", 6)],
            &OperationId::new("SUB-000001"),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::InsufficientStock {
            requested: 6,
            sellable: 5,
            ..
        }
    ));
    assert_eq!(counts(&ledger, "milk"), (10, 0));
    assert_eq!(counts(&ledger, "bread"), (5, 0));
}

#[test]
fn test_duplicate_lines_are_merged() {
    let ledger = ledger();
    let err = ledger
        .reserve_group(
            &StoreId::new("S1"),
            &[req("bread", 3), req("bread", 3)],
            &OperationId::new("SUB-000001"),
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::InsufficientStock { requested: 6, .. }));

    let lines = ledger
        .reserve_group(
            &StoreId::new("S1"),
            &[req("bread", 2), req("bread", 3)],
            &OperationId::new("SUB-000002"),
        )
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 5);
}

#[test]
fn test_commit_beyond_reserved_is_rejected() {
    let ledger = ledger();
    let store = StoreId::new("S1");
    let milk = ProductId::new("milk");
    ledger
        .reserve(&store, &milk, 2, &OperationId::new("a"))
        .unwrap();
    let err = ledger
        .commit(&store, &milk, 3, &OperationId::new("a"))
        .unwrap_err();
    assert!(matches!(err, DispatchError::ReservationMismatch { reserved: 2, .. }));
}

#[test]
fn test_unknown_record() {
    let err = ledger()
        .reserve(
            &StoreId::new("S1"),
            &ProductId::new("caviar"),
            1,
            &OperationId::new("a"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_inventory");
}

#[test]
fn test_low_stock_report() {
    let ledger = ledger();
    ledger
        .reserve(
            &StoreId::new("S1"),
            &ProductId::new("bread"),
            1,
            &OperationId::new("a"),
        )
        .unwrap();

    let low = ledger.low_stock(&StoreId::new("S1")).unwrap();
    let eggs = low
        .iter()
        .find(|i| i.product_id == ProductId::new("eggs"))
        .unwrap();
    assert_eq!(eggs.status, StockStatus::OutOfStock);
    assert_eq!(eggs.suggested_restock, 6);
    assert!(low.iter().all(|i| i.product_id != ProductId::new("milk")));
}

#[test]
fn test_group_quantity_overflow_is_rejected() {
    let ledger = ledger();
    let err = ledger
        .reserve_group(
            &StoreId::new("S1"),
            &[req("milk", u32::MAX), req("milk", 1)],
            &OperationId::new("SUB-000001"),
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidCart(_)));
    assert_eq!(counts(&ledger, "milk"), (10, 0));
}

#[test]
fn test_restock_overflow_is_rejected() {
    let ledger = ledger();
    let err = ledger
        .restock(
            &StoreId::new("S1"),
            &ProductId::new("milk"),
            u32::MAX,
            &OperationId::new("restock-1"),
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::ParseError(_)));
    assert_eq!(counts(&ledger, "milk"), (10, 0));
}

#[test]
fn test_restock_replay_window_is_bounded() {
    let ledger = ledger();
    let (store, milk) = (StoreId::new("S1"), ProductId::new("milk"));
    for n in 0..300 {
        assert!(ledger
            .restock(&store, &milk, 1, &OperationId(format!("restock-{n}")))
            .unwrap());
    }
    let record = ledger.record(&store, &milk).unwrap();
    assert_eq!(record.available, 310);
    assert_eq!(record.applied_ops.len(), RESTOCK_REPLAY_WINDOW);
    assert_eq!(record.restock_ops.len(), RESTOCK_REPLAY_WINDOW);

    // recent deliveries still replay as no-ops
    assert!(!ledger
        .restock(&store, &milk, 1, &OperationId::new("restock-299"))
        .unwrap());
    assert_eq!(counts(&ledger, "milk"), (310, 0));
}

#[test]
fn test_forgotten_group_leaves_no_operation_ids() {
    let ledger = ledger();
    let store = StoreId::new("S1");
    let op = OperationId::new("SUB-000001");
    let lines = [req("milk", 2), req("bread", 1)];
    ledger.reserve_group(&store, &lines, &op).unwrap();
    ledger.commit_group(&store, &lines, &op).unwrap();

    ledger.forget_group(&store, &lines, &op).unwrap();
    for product in ["milk", "bread"] {
        let record = ledger.record(&store, &ProductId::new(product)).unwrap();
        assert!(record.applied_ops.is_empty());
    }
    assert_eq!(counts(&ledger, "milk"), (8, 0));
    assert_eq!(counts(&ledger, "bread"), (4, 0));
}
