//! In-process [`DocumentStore`].
//!
//! Behaves like the hosted store for everything this crate relies on:
//! per-document ordering of writes, atomic batches, filtered and ordered
//! queries with cursors, and live subscriptions that deliver the initial
//! result set followed by one change batch per write.
//!
//! It also counts writes, queries and live listeners, and can be told to
//! fail upcoming calls, so tests can assert on store traffic.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    ChangeBatch, ChangeKind, ChangeStream, Cursor, Document, DocumentChange, DocumentStore,
    FieldUpdates, Query, Snapshot, StoreError, WriteBatch, WriteOp,
};

type Sender = mpsc::UnboundedSender<Result<ChangeBatch, StoreError>>;

/// An in-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    writes: AtomicUsize,
    queries: AtomicUsize,
    failing_queries: AtomicUsize,
    failing_writes: AtomicUsize,
    next_listener: AtomicU64,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Document>>,
    listeners: Vec<Listener>,
}

struct Listener {
    id: u64,
    query: Query,
    /// Ids currently in this listener's result set.
    matching: HashSet<String>,
    tx: Sender,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write calls (`set`, `update`, `delete`, `commit`).
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    /// Number of one-shot queries executed, failed ones included.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(AtomicOrdering::SeqCst)
    }

    /// Number of subscriptions whose stream is still alive.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        let mut inner = self.lock();
        inner.listeners.retain(|listener| !listener.tx.is_closed());
        inner.listeners.len()
    }

    /// Make the next `n` queries fail with [`StoreError::Unavailable`].
    pub fn fail_next_queries(&self, n: usize) {
        self.failing_queries.store(n, AtomicOrdering::SeqCst);
    }

    /// Make the next `n` write calls fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, AtomicOrdering::SeqCst);
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.lock().collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if the collection holds no documents.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume one pending injected failure, if any.
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    /// Validate, apply and broadcast a list of operations as one unit.
    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        validate(&inner, &ops)?;

        let mut touched: Vec<(String, String)> = Vec::new();
        for op in ops {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    fields,
                } => {
                    inner
                        .collections
                        .entry(collection.clone())
                        .or_default()
                        .insert(id.clone(), fields);
                    touched.push((collection, id));
                }
                WriteOp::Update {
                    collection,
                    id,
                    updates,
                } => {
                    if let Some(doc) = inner
                        .collections
                        .get_mut(&collection)
                        .and_then(|docs| docs.get_mut(&id))
                    {
                        apply_updates(doc, &updates);
                    }
                    touched.push((collection, id));
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(docs) = inner.collections.get_mut(&collection) {
                        docs.remove(&id);
                    }
                    touched.push((collection, id));
                }
            }
        }

        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        broadcast(&mut inner, &touched);
        Ok(())
    }
}

/// Reject the whole batch if any update targets a missing document or has an
/// empty field path.
fn validate(inner: &Inner, ops: &[WriteOp]) -> Result<(), StoreError> {
    let mut exists: HashMap<(&str, &str), bool> = HashMap::new();
    for op in ops {
        match op {
            WriteOp::Set { collection, id, .. } => {
                exists.insert((collection.as_str(), id.as_str()), true);
            }
            WriteOp::Delete { collection, id } => {
                exists.insert((collection.as_str(), id.as_str()), false);
            }
            WriteOp::Update {
                collection,
                id,
                updates,
            } => {
                if updates.iter().any(|(path, _)| path.segments().is_empty()) {
                    return Err(StoreError::InvalidRequest("empty field path".into()));
                }
                let present = exists
                    .get(&(collection.as_str(), id.as_str()))
                    .copied()
                    .unwrap_or_else(|| {
                        inner
                            .collections
                            .get(collection)
                            .is_some_and(|docs| docs.contains_key(id))
                    });
                if !present {
                    return Err(StoreError::NotFound {
                        collection: collection.clone(),
                        id: id.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Write each path, creating intermediate objects as needed.
fn apply_updates(doc: &mut Document, updates: &FieldUpdates) {
    for (path, value) in updates.iter() {
        let Some((last, parents)) = path.segments().split_last() else {
            continue;
        };
        let mut target = &mut *doc;
        for segment in parents {
            let slot = target
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Document::new()));
            if !slot.is_object() {
                *slot = Value::Object(Document::new());
            }
            let Some(next) = slot.as_object_mut() else {
                return;
            };
            target = next;
        }
        target.insert(last.clone(), value.clone());
    }
}

/// Send every listener the changes the touched documents caused in its
/// result set. Listeners whose stream was dropped are removed.
fn broadcast(inner: &mut Inner, touched: &[(String, String)]) {
    let Inner {
        collections,
        listeners,
    } = inner;

    listeners.retain_mut(|listener| {
        let mut batch = ChangeBatch::default();
        let mut seen = HashSet::new();
        for (collection, id) in touched {
            if collection != &listener.query.collection || !seen.insert(id.as_str()) {
                continue;
            }
            let current = collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .filter(|doc| listener.query.matches(doc));
            let was_matching = listener.matching.contains(id);
            let change = match (was_matching, current) {
                (false, Some(doc)) => {
                    listener.matching.insert(id.clone());
                    Some((ChangeKind::Added, doc.clone()))
                }
                (true, Some(doc)) => Some((ChangeKind::Modified, doc.clone())),
                (true, None) => {
                    listener.matching.remove(id);
                    Some((ChangeKind::Removed, Document::new()))
                }
                (false, None) => None,
            };
            if let Some((kind, data)) = change {
                batch.changes.push(DocumentChange {
                    kind,
                    snapshot: Snapshot::new(id.clone(), data),
                });
            }
        }

        if batch.is_empty() {
            return !listener.tx.is_closed();
        }
        let delivered = listener.tx.send(Ok(batch)).is_ok();
        if !delivered {
            trace!(listener = listener.id, "Dropping closed listener");
        }
        delivered
    });
}

/// Compare two JSON values the way the store orders them: null < bool <
/// number < string < everything else.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    const fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Position of `(value, id)` relative to another position under `query`'s
/// ordering. Ties on the order-by value are broken by id ascending.
fn compare_positions(query: &Query, a: (&Value, &str), b: (&Value, &str)) -> Ordering {
    let by_value = compare_values(a.0, b.0);
    let by_value = match &query.order_by {
        Some(order) if order.descending => by_value.reverse(),
        _ => by_value,
    };
    by_value.then_with(|| a.1.cmp(b.1))
}

fn sort_value<'a>(query: &Query, doc: &'a Document) -> &'a Value {
    static NULL: Value = Value::Null;
    query
        .order_by
        .as_ref()
        .and_then(|order| doc.get(&order.field))
        .unwrap_or(&NULL)
}

/// Execute a query against one collection's documents.
fn run_query(docs: Option<&BTreeMap<String, Document>>, query: &Query) -> Vec<Snapshot> {
    let Some(docs) = docs else {
        return Vec::new();
    };

    let mut matching: Vec<(&String, &Document)> =
        docs.iter().filter(|(_, doc)| query.matches(doc)).collect();
    matching.sort_by(|(a_id, a), (b_id, b)| {
        compare_positions(
            query,
            (sort_value(query, a), a_id.as_str()),
            (sort_value(query, b), b_id.as_str()),
        )
    });

    let start = query.start_after.as_ref().map_or(0, |cursor: &Cursor| {
        matching
            .iter()
            .position(|(id, doc)| {
                compare_positions(
                    query,
                    (sort_value(query, doc), id.as_str()),
                    (&cursor.value, cursor.id.as_str()),
                ) == Ordering::Greater
            })
            .unwrap_or(matching.len())
    });

    matching
        .into_iter()
        .skip(start)
        .take(query.limit.unwrap_or(usize::MAX))
        .map(|(id, doc)| Snapshot::new(id.clone(), doc.clone()))
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| Snapshot::new(id, doc.clone())))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>, StoreError> {
        self.queries.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_failure(&self.failing_queries) {
            return Err(StoreError::Unavailable("injected query failure".into()));
        }
        let inner = self.lock();
        Ok(run_query(inner.collections.get(&query.collection), query))
    }

    async fn set_document(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        self.check_write()?;
        self.apply(vec![WriteOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        }])
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        updates: FieldUpdates,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.apply(vec![WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            updates,
        }])
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.apply(vec![WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }])
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_write()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.apply(batch.into_ops())
    }

    async fn subscribe(&self, query: Query) -> Result<ChangeStream, StoreError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, AtomicOrdering::SeqCst);

        {
            let mut inner = self.lock();
            let mut unbounded = query.clone();
            unbounded.limit = None;
            unbounded.start_after = None;
            let initial = run_query(inner.collections.get(&query.collection), &unbounded);
            let matching = initial.iter().map(|snapshot| snapshot.id.clone()).collect();
            let batch = ChangeBatch {
                changes: initial
                    .into_iter()
                    .map(|snapshot| DocumentChange {
                        kind: ChangeKind::Added,
                        snapshot,
                    })
                    .collect(),
            };
            // The receiver is alive in this scope, so the send cannot fail.
            let _ = tx.send(Ok(batch));
            inner.listeners.push(Listener {
                id,
                query,
                matching,
                tx,
            });
        }
        debug!(listener = id, "Registered listener");

        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::store::{FieldPath, Filter};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, at) in [("a", 1), ("b", 3), ("c", 2), ("d", 3)] {
            store
                .set_document("orders", id, doc(json!({"createdAt": at, "customerId": "u1"})))
                .await
                .unwrap();
        }
        store
    }

    fn ids(snapshots: &[Snapshot]) -> Vec<&str> {
        snapshots.iter().map(|s| s.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_query_orders_and_limits() {
        let store = seeded().await;
        let query = Query::collection("orders").order_by_desc("createdAt").limit(3);
        let page = store.query(&query).await.unwrap();
        assert_eq!(ids(&page), vec!["b", "d", "c"]);
    }

    #[tokio::test]
    async fn test_query_cursor_resumes_after_last_document() {
        let store = seeded().await;
        let query = Query::collection("orders").order_by_desc("createdAt").limit(2);
        let first = store.query(&query).await.unwrap();
        let cursor = Cursor::after(first.last().unwrap(), "createdAt");
        let second = store.query(&query.clone().start_after(cursor)).await.unwrap();
        assert_eq!(ids(&first), vec!["b", "d"]);
        assert_eq!(ids(&second), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_update_missing_document_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_fields("orders", "nope", FieldUpdates::new().set("status", "flagged"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_nested_update_with_dotted_segment() {
        let store = MemoryStore::new();
        store
            .set_document("chats", "c1", doc(json!({"unread": {"a@x.io": true}})))
            .await
            .unwrap();
        store
            .update_fields(
                "chats",
                "c1",
                FieldUpdates::new().set(FieldPath::new(["unread", "a@x.io"]), false),
            )
            .await
            .unwrap();
        let snapshot = store.get_document("chats", "c1").await.unwrap().unwrap();
        assert_eq!(snapshot.data["unread"], json!({"a@x.io": false}));
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let batch = WriteBatch::new()
            .set("chats/c1/messages", "m1", doc(json!({"senderId": "a"})))
            .update("chats", "c1", FieldUpdates::new().set("lastMessage", json!({})));
        assert!(store.commit(batch).await.is_err());
        assert!(store.is_empty("chats/c1/messages"));
    }

    #[tokio::test]
    async fn test_subscription_delivers_initial_and_changes() {
        let store = seeded().await;
        let query = Query::collection("orders").filter(Filter::equals("customerId", "u1"));
        let mut stream = store.subscribe(query).await.unwrap();

        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.changes.len(), 4);

        store
            .update_fields("orders", "a", FieldUpdates::new().set("customerId", "u2"))
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].kind, ChangeKind::Removed);
        assert_eq!(batch.changes[0].snapshot.id, "a");

        store
            .set_document("orders", "e", doc(json!({"customerId": "u1"})))
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.changes[0].kind, ChangeKind::Added);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_listener() {
        let store = MemoryStore::new();
        let stream = store.subscribe(Query::collection("chats")).await.unwrap();
        assert_eq!(store.listener_count(), 1);
        drop(stream);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_queries(1);
        assert!(store.query(&Query::collection("orders")).await.is_err());
        assert!(store.query(&Query::collection("orders")).await.is_ok());
        assert_eq!(store.query_count(), 2);

        store.fail_next_writes(1);
        assert!(store.delete_document("orders", "x").await.is_err());
        assert_eq!(store.write_count(), 0);
    }
}
