//! Live feed scenarios: reconciliation and listener lifecycle.

use packline_core::{ChatKind, CustomerKeys, CustomerRef, OrderStatus, ProductType, UserRole};
use packline_integration_tests::{TestContext, item};
use packline_sync::models::{Brand, DocumentModel};
use packline_sync::services::{NewOrder, OrderScope};
use packline_sync::store::collections;
use packline_sync::{Actor, DocumentStore};

#[tokio::test]
async fn test_order_feed_tracks_ledger() {
    let ctx = TestContext::new();
    let ann = ctx
        .seed_user("uid-ann", "ann@shop.example", "Ann", UserRole::Customer)
        .await;
    let customer = ctx.sign_in(&ann);
    let staff = Actor::new("emp-1", UserRole::Employee);

    let feed = ctx
        .coordinator
        .order_feed(&customer, OrderScope::Customer(CustomerRef::ByUid(ann.id.clone())))
        .await
        .expect("order feed");
    assert!(feed.wait_for(|v| v.ready).await.expect("ready").orders.is_empty());

    let order = ctx
        .ledger
        .create_order(
            &customer,
            NewOrder {
                customer: CustomerKeys::new(ann.id.clone(), ann.email.clone()),
                account_manager_id: None,
                brand: Brand::new("b-1", "Moonleaf"),
                items: vec![item("Mylar bag", 2, 350, ProductType::Bag)],
                attachments: Vec::new(),
            },
        )
        .await
        .expect("create order");
    let view = feed.wait_for(|v| v.orders.len() == 1).await.expect("view");
    assert_eq!(view.count(OrderStatus::Pending), 1);

    ctx.ledger
        .update_status(&staff, &order, OrderStatus::Flagged)
        .await
        .expect("flag");
    let view = feed
        .wait_for(|v| v.count(OrderStatus::Flagged) == 1)
        .await
        .expect("view");
    assert_eq!(view.count(OrderStatus::Pending), 0);

    let admin = Actor::new("admin-1", UserRole::Admin);
    ctx.ledger.delete_order(&admin, &order).await.expect("delete");
    feed.wait_for(|v| v.orders.is_empty()).await.expect("view");
}

#[tokio::test]
async fn test_order_with_overflowing_items_is_skipped() {
    let ctx = TestContext::new();
    let staff = Actor::new("emp-1", UserRole::Employee);
    let feed = ctx
        .coordinator
        .order_feed(&staff, OrderScope::All)
        .await
        .expect("order feed");
    feed.wait_for(|v| v.ready).await.expect("ready");

    let raw = serde_json::json!({
        "customerId": "uid-ann",
        "items": [{"name": "Mylar bag", "quantity": i64::MAX, "price": 1_000_000_000_000_i64}],
    });
    ctx.store
        .set_document(collections::ORDERS, "o-huge", raw.as_object().cloned().expect("object"))
        .await
        .expect("write raw order");

    // The feed keeps running and picks up the next valid order.
    ctx.ledger
        .create_order(
            &staff,
            NewOrder {
                customer: CustomerKeys::uid_only("uid-ann".into()),
                account_manager_id: None,
                brand: Brand::new("b-1", "Moonleaf"),
                items: vec![item("Mylar bag", 1, 350, ProductType::Bag)],
                attachments: Vec::new(),
            },
        )
        .await
        .expect("create order");
    let view = feed.wait_for(|v| v.orders.len() == 1).await.expect("view");
    assert_ne!(view.orders[0].id.as_str(), "o-huge");
}

#[tokio::test]
async fn test_redelivered_snapshot_changes_nothing() {
    let ctx = TestContext::new();
    let mia = ctx
        .seed_user("am-1", "mia@packline.example", "Mia", UserRole::AccountManager)
        .await;
    let ann = ctx
        .seed_user("uid-ann", "ann@shop.example", "Ann", UserRole::Customer)
        .await;
    let chat = ctx
        .registry
        .create_chat(&Actor::from(&mia), vec![ann.id.clone()], None, ChatKind::Customer)
        .await
        .expect("create chat");

    let feed = ctx.coordinator.chat_feed(&ann.id).await.expect("chat feed");
    let before = feed.wait_for(|v| v.chats.len() == 1).await.expect("view");

    // Writing the same document again is delivered but reconciles to the
    // same view.
    let stored = ctx
        .store
        .get_document(collections::CHATS, chat.id.as_str())
        .await
        .expect("get")
        .expect("present");
    ctx.store
        .set_document(collections::CHATS, chat.id.as_str(), stored.data.clone())
        .await
        .expect("rewrite");
    let chat_again = ctx.registry.get_chat(&chat.id).await.expect("get chat");
    assert_eq!(chat_again.encode(), stored.data);

    // A real change afterwards proves the rewrite was processed.
    ctx.registry
        .mark_read(&chat_again, &ann.id)
        .await
        .expect("mark read");
    let after = feed.wait_for(|v| v.unread_count == 0).await.expect("view");
    assert_eq!(before.unread_count, 1);
    assert_eq!(after.chats.len(), 1);
    assert_eq!(after.chats[0].id, before.chats[0].id);
    assert_eq!(after.chats[0].participants, before.chats[0].participants);
}

#[tokio::test]
async fn test_optimistic_removal_then_store_delete() {
    let ctx = TestContext::new();
    let mia = ctx
        .seed_user("am-1", "mia@packline.example", "Mia", UserRole::AccountManager)
        .await;
    let manager = Actor::from(&mia);
    let chat = ctx
        .registry
        .create_chat(&manager, vec!["uid-ann".into()], None, ChatKind::Customer)
        .await
        .expect("create chat");

    let feed = ctx.coordinator.chat_feed(&mia.id).await.expect("chat feed");
    feed.wait_for(|v| v.chats.len() == 1).await.expect("view");

    feed.remove_local(chat.id.as_str());
    feed.wait_for(|v| v.chats.is_empty()).await.expect("view");
    ctx.registry.delete_chat(&manager, &chat).await.expect("delete");
    assert!(feed.view().chats.is_empty());
    assert!(feed.view().topics.is_empty());
}

#[tokio::test]
async fn test_activation_cycles_do_not_leak_listeners() {
    let ctx = TestContext::new();
    let mia = ctx
        .seed_user("am-1", "mia@packline.example", "Mia", UserRole::AccountManager)
        .await;
    let manager = Actor::from(&mia);

    for _ in 0..5 {
        let chats = ctx.coordinator.chat_feed(&mia.id).await.expect("chat feed");
        let orders = ctx
            .coordinator
            .order_feed(&manager, OrderScope::All)
            .await
            .expect("order feed");
        chats.wait_for(|v| v.ready).await.expect("ready");
        orders.wait_for(|v| v.ready).await.expect("ready");
        assert_eq!(ctx.store.listener_count(), 2);

        chats.release().await;
        orders.release().await;
        assert_eq!(ctx.store.listener_count(), 0);
    }
}
