//! Live projections of store collections.
//!
//! A feed owns one subscription and one task. The task is the only place the
//! projection is mutated: change batches from the store and optimistic local
//! mutations both go through it, and every change that alters the projection
//! publishes a freshly derived view on a `watch` channel.
//!
//! Reconciliation is replace-by-id. A change whose raw document equals the
//! one already held is a no-op and publishes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use packline_core::{CustomerRef, OrderStatus, Permission, UserId};

use super::Actor;
use super::conversations::{ChatTopic, aggregate_topics, sort_by_activity};
use crate::error::{SyncError, SyncResult};
use crate::models::{Chat, DocumentModel, Order};
use crate::store::{ChangeBatch, ChangeKind, ChangeStream, Document, DocumentStore, Filter, Query, collections};

// =============================================================================
// Projection
// =============================================================================

/// Decoded entities keyed by document id, with the raw document kept for
/// change detection.
#[derive(Debug, Clone)]
pub struct Projection<T> {
    entries: BTreeMap<String, (Document, T)>,
}

impl<T> Default for Projection<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: DocumentModel> Projection<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id).map(|(_, entity)| entity)
    }

    /// Entities in id order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values().map(|(_, entity)| entity)
    }

    /// Apply a change batch. Returns whether anything changed.
    ///
    /// Malformed documents are skipped and the previous entry, if any, is
    /// kept.
    pub fn apply(&mut self, batch: &ChangeBatch) -> bool {
        let mut changed = false;
        for change in &batch.changes {
            let snapshot = &change.snapshot;
            match change.kind {
                ChangeKind::Removed => {
                    changed |= self.entries.remove(&snapshot.id).is_some();
                }
                ChangeKind::Added | ChangeKind::Modified => {
                    if self
                        .entries
                        .get(&snapshot.id)
                        .is_some_and(|(raw, _)| *raw == snapshot.data)
                    {
                        continue;
                    }
                    if let Some(entity) = T::decode(snapshot) {
                        self.entries
                            .insert(snapshot.id.clone(), (snapshot.data.clone(), entity));
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Insert or replace an entity ahead of the store. Returns whether
    /// anything changed.
    pub fn upsert(&mut self, entity: T) -> bool {
        let raw = entity.encode();
        let id = entity.document_id().to_string();
        if self.entries.get(&id).is_some_and(|(held, _)| *held == raw) {
            return false;
        }
        self.entries.insert(id, (raw, entity));
        true
    }

    /// Remove an entity ahead of the store. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }
}

// =============================================================================
// Feed
// =============================================================================

enum LocalMutation<T> {
    Upsert(T),
    Remove(String),
}

/// A live view over one subscription.
///
/// Dropping the feed (or calling [`Feed::release`]) stops the task and
/// closes the subscription.
pub struct Feed<T, V> {
    view: watch::Receiver<V>,
    local: mpsc::UnboundedSender<LocalMutation<T>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T, V> Feed<T, V>
where
    T: DocumentModel + Send + Sync + 'static,
    V: Clone + Default + Send + Sync + 'static,
{
    fn spawn<D>(kind: &'static str, mut stream: ChangeStream, derive: D) -> Self
    where
        D: Fn(&Projection<T>) -> V + Send + 'static,
    {
        let (view_tx, view) = watch::channel(V::default());
        let (local, mut local_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut projection = Projection::<T>::new();
            let mut ready = false;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(batch)) => {
                            let changed = projection.apply(&batch);
                            if changed || !ready {
                                ready = true;
                                view_tx.send_replace(derive(&projection));
                                debug!(kind, entries = projection.len(), "Published view");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(kind, error = %e, "Subscription error, keeping last view");
                        }
                        None => {
                            debug!(kind, "Subscription ended");
                            break;
                        }
                    },
                    Some(mutation) = local_rx.recv() => {
                        let changed = match mutation {
                            LocalMutation::Upsert(entity) => projection.upsert(entity),
                            LocalMutation::Remove(id) => projection.remove(&id),
                        };
                        if changed && ready {
                            view_tx.send_replace(derive(&projection));
                        }
                    }
                }
            }
        });

        Self {
            view,
            local,
            cancel,
            task: Some(task),
        }
    }

    /// The latest published view.
    #[must_use]
    pub fn view(&self) -> V {
        self.view.borrow().clone()
    }

    /// A receiver that observes every published view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<V> {
        self.view.clone()
    }

    /// Wait until a published view satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the feed stops first.
    pub async fn wait_for(&self, predicate: impl FnMut(&V) -> bool) -> SyncResult<V> {
        let mut view = self.view.clone();
        view.wait_for(predicate)
            .await
            .map(|v| v.clone())
            .map_err(|_| SyncError::Cancelled)
    }

    /// Optimistically insert or replace an entity.
    pub fn upsert_local(&self, entity: T) {
        if self.local.send(LocalMutation::Upsert(entity)).is_err() {
            debug!("Feed stopped, dropping local upsert");
        }
    }

    /// Optimistically remove an entity, e.g. right after deleting it.
    pub fn remove_local(&self, id: &str) {
        if self.local.send(LocalMutation::Remove(id.to_string())).is_err() {
            debug!("Feed stopped, dropping local removal");
        }
    }

    /// Stop the feed and wait for its subscription to close.
    pub async fn release(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Feed task ended abnormally");
        }
    }
}

impl<T, V> Drop for Feed<T, V> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// Views
// =============================================================================

/// What a chat list shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatFeedView {
    /// Whether the first snapshot has arrived.
    pub ready: bool,
    /// Chats by last activity, newest first.
    pub chats: Vec<Chat>,
    pub topics: Vec<ChatTopic>,
    /// Number of topics with unread messages.
    pub unread_count: usize,
}

impl ChatFeedView {
    fn derive(projection: &Projection<Chat>, me: &UserId) -> Self {
        let mut chats: Vec<Chat> = projection.values().cloned().collect();
        for chat in &mut chats {
            chat.prune_stale_unread();
        }
        sort_by_activity(&mut chats);
        let topics = aggregate_topics(&chats, me);
        let unread_count = topics.iter().filter(|topic| topic.has_unread).count();
        Self {
            ready: true,
            chats,
            topics,
            unread_count,
        }
    }
}

/// What an order list shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFeedView {
    pub ready: bool,
    /// Orders by creation time, newest first.
    pub orders: Vec<Order>,
    /// Count per status, in [`OrderStatus::ALL`] order.
    pub status_counts: Vec<(OrderStatus, usize)>,
}

impl OrderFeedView {
    fn derive(projection: &Projection<Order>) -> Self {
        let mut orders: Vec<Order> = projection.values().cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let status_counts = OrderStatus::ALL
            .iter()
            .map(|status| (*status, orders.iter().filter(|o| o.status == *status).count()))
            .collect();
        Self {
            ready: true,
            orders,
            status_counts,
        }
    }

    /// Orders currently in `status`.
    #[must_use]
    pub fn count(&self, status: OrderStatus) -> usize {
        self.status_counts
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }
}

pub type ChatFeed = Feed<Chat, ChatFeedView>;
pub type OrderFeed = Feed<Order, OrderFeedView>;

/// Which orders an order feed covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderScope {
    /// Every order. Needs `ViewAllOrders`.
    All,
    /// Orders stored under one customer key.
    Customer(CustomerRef),
    /// Orders of an account manager's accounts.
    AccountManager(UserId),
}

impl OrderScope {
    fn query(&self) -> Query {
        let query = Query::collection(collections::ORDERS);
        match self {
            Self::All => query,
            Self::Customer(reference) => {
                query.filter(Filter::equals(reference.order_field(), reference.value()))
            }
            Self::AccountManager(manager) => {
                query.filter(Filter::equals("accountManagerId", manager.as_str()))
            }
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Opens feeds over the store.
pub struct SyncCoordinator {
    store: Arc<dyn DocumentStore>,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Live chats of `me`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the subscription could not be opened.
    #[instrument(skip(self))]
    pub async fn chat_feed(&self, me: &UserId) -> SyncResult<ChatFeed> {
        let query = Query::collection(collections::CHATS)
            .filter(Filter::array_contains("participants", me.as_str()));
        let stream = self.store.subscribe(query).await?;
        let me = me.clone();
        info!(uid = %me, "Chat feed opened");
        Ok(Feed::spawn(Chat::KIND, stream, move |projection| {
            ChatFeedView::derive(projection, &me)
        }))
    }

    /// Live orders in `scope`.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` for [`OrderScope::All`] without
    /// `ViewAllOrders`, or a store error.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn order_feed(&self, actor: &Actor, scope: OrderScope) -> SyncResult<OrderFeed> {
        if scope == OrderScope::All {
            actor.require(Permission::ViewAllOrders)?;
        }
        let stream = self.store.subscribe(scope.query()).await?;
        info!("Order feed opened");
        Ok(Feed::spawn(Order::KIND, stream, OrderFeedView::derive))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use packline_core::{ChatId, ChatKind, CustomerKeys, Email, Money, OrderId, ProductType, UserRole};
    use serde_json::json;

    use super::*;
    use crate::models::{Brand, ChatMessage, MessageContent, OrderItem};
    use crate::store::{DocumentChange, MemoryStore, Snapshot};

    fn chat(id: &str, participants: &[&str], unread: &[(&str, bool)], at_secs: i64) -> Chat {
        Chat {
            id: ChatId::new(id),
            participants: participants.iter().map(|p| UserId::new(*p)).collect(),
            last_message: Some(ChatMessage::new(
                UserId::new(participants[0]),
                MessageContent::Text("hi".into()),
                Utc.timestamp_opt(at_secs, 0).single().unwrap(),
            )),
            kind: ChatKind::Customer,
            unread: unread.iter().map(|(k, v)| (UserId::new(*k), *v)).collect(),
            title: None,
            created_at: Utc.timestamp_opt(0, 0).single().unwrap(),
        }
    }

    fn order(id: &str, status: OrderStatus, at_secs: i64) -> Order {
        Order {
            id: OrderId::new(id),
            customer: CustomerKeys::email_only(Email::parse("ann@shop.example").unwrap()),
            account_manager_id: Some(UserId::new("am-1")),
            brand: Brand::new("b1", "Moonleaf"),
            items: vec![OrderItem::new("Mylar bag", 2, Money::from_cents(150), ProductType::Bag)],
            status,
            created_at: Utc.timestamp_opt(at_secs, 0).single().unwrap(),
            total_amount: Money::from_cents(300),
            attachments: Vec::new(),
        }
    }

    fn added(id: &str, data: Document) -> ChangeBatch {
        ChangeBatch {
            changes: vec![DocumentChange {
                kind: ChangeKind::Added,
                snapshot: Snapshot::new(id, data),
            }],
        }
    }

    #[test]
    fn test_projection_reapply_is_noop() {
        let mut projection = Projection::<Chat>::new();
        let batch = added("c-1", chat("c-1", &["a", "b"], &[("b", true)], 10).encode());
        assert!(projection.apply(&batch));
        assert!(!projection.apply(&batch));
        assert_eq!(projection.len(), 1);
    }

    #[test]
    fn test_projection_skips_malformed_and_keeps_previous() {
        let mut projection = Projection::<Chat>::new();
        projection.apply(&added("c-1", chat("c-1", &["a", "b"], &[], 10).encode()));
        let malformed = added("c-1", json!({"title": "no participants"}).as_object().cloned().unwrap());
        assert!(!projection.apply(&malformed));
        assert_eq!(projection.get("c-1").unwrap().participants.len(), 2);

        let removed = ChangeBatch {
            changes: vec![DocumentChange {
                kind: ChangeKind::Removed,
                snapshot: Snapshot::new("c-1", Document::new()),
            }],
        };
        assert!(projection.apply(&removed));
        assert!(!projection.apply(&removed));
        assert!(projection.is_empty());
    }

    #[test]
    fn test_chat_view_prunes_and_counts_topics() {
        let mut projection = Projection::<Chat>::new();
        projection.upsert(chat("c-1", &["x", "me"], &[("me", true), ("left", true)], 10));
        projection.upsert(chat("c-2", &["x", "me"], &[("me", false)], 30));
        projection.upsert(chat("c-3", &["y", "me"], &[("me", false)], 20));

        let view = ChatFeedView::derive(&projection, &UserId::new("me"));
        assert!(view.ready);
        let ids: Vec<_> = view.chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c-2", "c-3", "c-1"]);
        assert!(!view.chats[2].unread.contains_key(&UserId::new("left")));
        assert_eq!(view.topics.len(), 2);
        assert_eq!(view.unread_count, 1);
    }

    #[test]
    fn test_order_view_counts_statuses() {
        let mut projection = Projection::<Order>::new();
        projection.upsert(order("o-1", OrderStatus::Pending, 10));
        projection.upsert(order("o-2", OrderStatus::Pending, 30));
        projection.upsert(order("o-3", OrderStatus::Completed, 20));
        let view = OrderFeedView::derive(&projection);
        assert_eq!(view.orders[0].id.as_str(), "o-2");
        assert_eq!(view.count(OrderStatus::Pending), 2);
        assert_eq!(view.count(OrderStatus::Completed), 1);
        assert_eq!(view.count(OrderStatus::Flagged), 0);
    }

    #[tokio::test]
    async fn test_chat_feed_follows_store() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = SyncCoordinator::new(store.clone());
        let feed = coordinator.chat_feed(&UserId::new("me")).await.unwrap();
        let initial = feed.wait_for(|v| v.ready).await.unwrap();
        assert!(initial.chats.is_empty());

        let c1 = chat("c-1", &["x", "me"], &[("me", true)], 10);
        store.set_document(collections::CHATS, "c-1", c1.encode()).await.unwrap();
        store
            .set_document(collections::CHATS, "other", chat("other", &["x", "y"], &[], 10).encode())
            .await
            .unwrap();
        let view = feed.wait_for(|v| v.chats.len() == 1).await.unwrap();
        assert_eq!(view.unread_count, 1);

        store
            .update_fields(
                collections::CHATS,
                "c-1",
                crate::store::FieldUpdates::new().set(crate::store::FieldPath::new(["unread", "me"]), false),
            )
            .await
            .unwrap();
        feed.wait_for(|v| v.unread_count == 0).await.unwrap();

        feed.remove_local("c-1");
        feed.wait_for(|v| v.chats.is_empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_closes_listener() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = SyncCoordinator::new(store.clone());
        for _ in 0..3 {
            let feed = coordinator.chat_feed(&UserId::new("me")).await.unwrap();
            feed.wait_for(|v| v.ready).await.unwrap();
            assert_eq!(store.listener_count(), 1);
            feed.release().await;
            assert_eq!(store.listener_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_order_feed_scopes() {
        let store = Arc::new(MemoryStore::new());
        let mut other = order("o-2", OrderStatus::Flagged, 20);
        other.account_manager_id = Some(UserId::new("am-2"));
        for o in [order("o-1", OrderStatus::Pending, 10), other] {
            store.set_document(collections::ORDERS, o.id.as_str(), o.encode()).await.unwrap();
        }
        let coordinator = SyncCoordinator::new(store.clone());

        let customer = Actor::new("ann", UserRole::Customer);
        assert!(matches!(
            coordinator.order_feed(&customer, OrderScope::All).await.err(),
            Some(SyncError::PermissionDenied { .. })
        ));

        let staff = Actor::new("am-1", UserRole::AccountManager);
        let all = coordinator.order_feed(&staff, OrderScope::All).await.unwrap();
        assert_eq!(all.wait_for(|v| v.ready).await.unwrap().orders.len(), 2);

        let mine = coordinator
            .order_feed(&staff, OrderScope::AccountManager(UserId::new("am-1")))
            .await
            .unwrap();
        let view = mine.wait_for(|v| v.ready).await.unwrap();
        assert_eq!(view.orders.len(), 1);
        assert_eq!(view.count(OrderStatus::Pending), 1);

        let by_email = coordinator
            .order_feed(
                &customer,
                OrderScope::Customer(CustomerRef::ByEmail(Email::parse("ann@shop.example").unwrap())),
            )
            .await
            .unwrap();
        assert_eq!(by_email.wait_for(|v| v.ready).await.unwrap().orders.len(), 2);
    }
}
