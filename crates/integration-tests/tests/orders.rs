//! Order ledger scenarios.

use std::time::Duration;

use packline_core::{CustomerKeys, Email, Money, OrderStatus, ProductType, UserId, UserRole};
use packline_integration_tests::{TestContext, dec, item};
use packline_sync::models::{Brand, DocumentModel, Order};
use packline_sync::services::NewOrder;
use packline_sync::store::collections;
use packline_sync::{DocumentStore, SyncConfig, SyncError};

fn new_order(customer: CustomerKeys, items: Vec<packline_sync::models::OrderItem>) -> NewOrder {
    NewOrder {
        customer,
        account_manager_id: Some(UserId::new("am-1")),
        brand: Brand::new("b-1", "Moonleaf"),
        items,
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn test_order_lifecycle() {
    let ctx = TestContext::new();
    let ann = ctx
        .seed_user("uid-ann", "ann@shop.example", "Ann", UserRole::Customer)
        .await;
    let mia = ctx
        .seed_user("am-1", "mia@packline.example", "Mia", UserRole::AccountManager)
        .await;
    let customer = ctx.sign_in(&ann);
    let manager = packline_sync::Actor::from(&mia);

    let order = ctx
        .ledger
        .create_order(
            &customer,
            new_order(
                CustomerKeys::new(ann.id.clone(), ann.email.clone()),
                vec![
                    item("Mylar bag", 2, 350, ProductType::Bag),
                    item("Die-cut sticker", 4, 100, ProductType::Sticker),
                ],
            ),
        )
        .await
        .expect("create order");
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_amount, Money::new(dec("11.00")));
    assert_eq!(order.total_amount.to_string(), "$11.00");

    let order = ctx
        .ledger
        .update_status(&manager, &order, OrderStatus::InProgress)
        .await
        .expect("update status");
    let stored = ctx.ledger.get_order(&order.id).await.expect("get order");
    assert_eq!(stored.status, OrderStatus::InProgress);

    let order = ctx
        .ledger
        .edit_items(
            &manager,
            &stored,
            vec![
                item("Mylar bag", 3, 350, ProductType::Bag),
                item("Sales tax", 1, 84, ProductType::Tax),
                item("Returning customer", 1, -100, ProductType::Discount),
            ],
        )
        .await
        .expect("edit items");
    assert_eq!(order.total_amount, Money::new(dec("10.34")));
    let stored = ctx.ledger.get_order(&order.id).await.expect("get order");
    assert_eq!(stored.total_amount, Money::new(dec("10.34")));
    assert!(stored.total_is_consistent());

    // Customers cannot delete, and nothing is written when they try.
    let writes = ctx.store.write_count();
    let err = ctx
        .ledger
        .delete_order(&customer, &stored)
        .await
        .expect_err("customer delete");
    assert!(matches!(err, SyncError::PermissionDenied { .. }));
    assert_eq!(ctx.store.write_count(), writes);

    ctx.ledger
        .delete_order(&manager, &stored)
        .await
        .expect("manager delete");
    assert!(matches!(
        ctx.ledger.get_order(&stored.id).await,
        Err(SyncError::NotFound { kind: "order", .. })
    ));
    assert!(matches!(
        ctx.ledger
            .update_status(&manager, &stored, OrderStatus::Completed)
            .await,
        Err(SyncError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_total_ignores_item_order() {
    let items = vec![
        item("Mylar bag", 7, 333, ProductType::Bag),
        item("QP bag", 1, 1299, ProductType::QpBag),
        item("Tax", 1, 257, ProductType::Tax),
        item("Discount", 1, -500, ProductType::Discount),
    ];
    let expected = packline_sync::models::order::compute_total(&items);
    assert_eq!(expected, Some(Money::new(dec("33.87"))));

    let mut rotated = items.clone();
    for _ in 0..items.len() {
        rotated.rotate_left(1);
        assert_eq!(packline_sync::models::order::compute_total(&rotated), expected);
    }
    let mut reversed = items;
    reversed.reverse();
    assert_eq!(packline_sync::models::order::compute_total(&reversed), expected);
}

#[tokio::test]
async fn test_order_document_round_trip() {
    let ctx = TestContext::new();
    let admin = ctx
        .seed_user("admin-1", "root@packline.example", "Root", UserRole::Admin)
        .await;
    let actor = packline_sync::Actor::from(&admin);
    let order = ctx
        .ledger
        .create_order(
            &actor,
            new_order(
                CustomerKeys::email_only(Email::parse("legacy@shop.example").expect("email")),
                vec![item("Mylar bag", 10, 125, ProductType::Bag)],
            ),
        )
        .await
        .expect("create order");

    let snapshot = ctx
        .store
        .get_document(collections::ORDERS, order.id.as_str())
        .await
        .expect("get")
        .expect("present");
    let decoded = Order::try_decode(&snapshot).expect("decode");
    assert_eq!(decoded, order);
    assert_eq!(decoded.total_amount, Money::new(dec("12.50")));
}

#[tokio::test]
async fn test_legacy_orders_found_by_email() {
    let ctx = TestContext::new();
    let ann = ctx
        .seed_user("uid-ann", "ann@shop.example", "Ann", UserRole::Customer)
        .await;
    let staff = packline_sync::Actor::new("emp-1", UserRole::Employee);

    // Written before the UID migration: email key only.
    ctx.ledger
        .create_order(
            &staff,
            new_order(
                CustomerKeys::email_only(ann.email.clone()),
                vec![item("Mylar bag", 1, 350, ProductType::Bag)],
            ),
        )
        .await
        .expect("create legacy order");

    ctx.sign_in(&ann);
    let queries = ctx.store.query_count();
    let orders = ctx
        .ledger
        .fetch_orders_for_customer(&CustomerKeys::uid_only(ann.id.clone()))
        .await
        .expect("fetch");
    assert_eq!(orders.len(), 1);
    assert_eq!(ctx.store.query_count() - queries, 2);

    // One failed lookup is absorbed by the fallback.
    ctx.store.fail_next_queries(1);
    let orders = ctx
        .ledger
        .fetch_orders_for_customer(&CustomerKeys::uid_only(ann.id.clone()))
        .await
        .expect("fetch after failure");
    assert_eq!(orders.len(), 1);

    // Every strategy failing surfaces the error.
    ctx.store.fail_next_queries(2);
    let err = ctx
        .ledger
        .fetch_orders_for_customer(&CustomerKeys::uid_only(ann.id.clone()))
        .await
        .expect_err("all lookups failed");
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_debounced_order_search_runs_once() {
    let ctx = TestContext::new();
    let staff = packline_sync::Actor::new("emp-1", UserRole::Employee);
    for brand in ["Moonleaf", "Sunpeak"] {
        let mut order = new_order(
            CustomerKeys::uid_only(UserId::new("uid-ann")),
            vec![item("Mylar bag", 1, 350, ProductType::Bag)],
        );
        order.brand = Brand::new(brand.to_lowercase(), brand);
        ctx.ledger.create_order(&staff, order).await.expect("create");
    }

    let search = ctx.ledger.debounced_search(staff);
    let mut results = search.results();
    let queries = ctx.store.query_count();

    search.input("m");
    tokio::time::sleep(Duration::from_millis(40)).await;
    search.input("mo");
    tokio::time::sleep(Duration::from_millis(40)).await;
    search.input("moon");

    let published = results
        .wait_for(|r| !r.query.is_empty())
        .await
        .expect("results")
        .clone();
    assert_eq!(published.query, "moon");
    assert_eq!(published.items.len(), 1);
    assert_eq!(published.items[0].brand.name, "Moonleaf");
    assert_eq!(ctx.store.query_count() - queries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_services_follow_configuration() {
    let config = SyncConfig {
        search_debounce: Duration::from_millis(100),
        storage_bucket: "packline-proofs".into(),
        ..SyncConfig::default()
    };
    let ctx = TestContext::with_config(config);
    let staff = packline_sync::Actor::new("emp-1", UserRole::Employee);
    let order = ctx
        .ledger
        .create_order(
            &staff,
            new_order(
                CustomerKeys::uid_only(UserId::new("uid-ann")),
                vec![item("Mylar bag", 1, 350, ProductType::Bag)],
            ),
        )
        .await
        .expect("create");

    let order = ctx
        .ledger
        .attach_file(&staff, &order, "proof.pdf", b"%PDF".to_vec(), "application/pdf")
        .await
        .expect("attach");
    let url = order.attachments[0].url.as_str();
    assert!(url.starts_with("https://storage.invalid/packline-proofs/orders/"), "{url}");

    let search = ctx.ledger.debounced_search(staff);
    let mut results = search.results();
    search.input("moonleaf");
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(results.borrow_and_update().query.is_empty());
    let published = results
        .wait_for(|r| !r.query.is_empty())
        .await
        .expect("results")
        .clone();
    assert_eq!(published.items.len(), 1);
}
