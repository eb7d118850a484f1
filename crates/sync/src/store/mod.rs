//! Document store abstraction.
//!
//! The hosted store is schemaless: a document is a JSON object keyed by an
//! opaque id inside a named collection. Everything in this crate talks to the
//! store through the [`DocumentStore`] trait so that the backend can be
//! swapped for [`MemoryStore`] in tests.
//!
//! # Collections
//!
//! - `users/{uid}` - user profiles and roles
//! - `orders/{orderId}` - orders with embedded items and attachments
//! - `chats/{chatId}` - chat summaries (participants, unread map, last message)
//! - `chats/{chatId}/messages/{messageId}` - append-only message log
//! - `notifications/{id}` - push requests consumed by the relay

pub mod fields;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;

/// A schemaless document body.
pub type Document = serde_json::Map<String, Value>;

/// Stream of change batches delivered by a subscription.
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch, StoreError>>;

/// Well-known collection names.
pub mod collections {
    pub const USERS: &str = "users";
    pub const ORDERS: &str = "orders";
    pub const CHATS: &str = "chats";
    pub const NOTIFICATIONS: &str = "notifications";

    /// The message sub-log of one chat.
    #[must_use]
    pub fn messages(chat_id: &str) -> String {
        format!("{CHATS}/{chat_id}/messages")
    }
}

/// Errors reported by a document store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend or network failure; the operation may succeed if retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An update targeted a document that does not exist.
    #[error("document not found: {collection}/{id}")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },

    /// The backend's security rules rejected the request.
    #[error("rejected by store rules: {0}")]
    Rejected(String),

    /// The request itself is malformed (empty field path, bad cursor).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Whether retrying the same request could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// Snapshots and changes
// =============================================================================

/// A point-in-time copy of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Document id within its collection.
    pub id: String,
    /// Document fields.
    pub data: Document,
}

impl Snapshot {
    /// Create a snapshot.
    #[must_use]
    pub fn new(id: impl Into<String>, data: Document) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// A field value, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// How a document changed relative to a subscription's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change delivered by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    /// Full current state for `Added`/`Modified`; only the id is meaningful
    /// for `Removed`.
    pub snapshot: Snapshot,
}

/// All changes produced by one write (or the initial result set).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
}

impl ChangeBatch {
    /// Returns `true` if the batch carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals the value.
    Equal,
    /// Field is an array containing the value.
    ArrayContains,
    /// Field equals one of the values (value must be an array).
    In,
}

/// A single field predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// `field == value`
    #[must_use]
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Equal,
            value: value.into(),
        }
    }

    /// `value in field[]`
    #[must_use]
    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::ArrayContains,
            value: value.into(),
        }
    }

    /// `field in values`
    #[must_use]
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            value: Value::Array(values),
        }
    }

    /// Evaluate the predicate against a document.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Equal => actual == &self.value,
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|options| options.contains(actual)),
        }
    }
}

/// Sort order of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// Position just after a document in a query's sort order.
///
/// Built from the last document of a page and carried forward to fetch the
/// next page.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    /// Id of the last document seen.
    pub id: String,
    /// That document's value for the query's order-by field.
    pub value: Value,
}

impl Cursor {
    /// Cursor positioned after `snapshot` for a query ordered by `field`.
    #[must_use]
    pub fn after(snapshot: &Snapshot, field: &str) -> Self {
        Self {
            id: snapshot.id.clone(),
            value: snapshot.get(field).cloned().unwrap_or(Value::Null),
        }
    }
}

/// A collection query.
///
/// `limit` and `start_after` apply to one-shot queries; subscriptions track
/// the whole filtered set.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

impl Query {
    /// All documents of a collection.
    #[must_use]
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    /// Add a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Order ascending by `field`.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    /// Order descending by `field`.
    #[must_use]
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    /// Return at most `limit` documents.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resume after `cursor`.
    #[must_use]
    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    /// Whether a document satisfies every filter.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }
}

// =============================================================================
// Writes
// =============================================================================

/// Path to a possibly nested field.
///
/// Segments are kept separate because participant identifiers (legacy email
/// addresses) contain dots and cannot be joined into a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// A path from explicit segments.
    #[must_use]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for FieldPath {
    fn from(field: &str) -> Self {
        Self(vec![field.to_string()])
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A partial update: field paths and their new values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdates(Vec<(FieldPath, Value)>);

impl FieldUpdates {
    /// An empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a top-level or nested field.
    #[must_use]
    pub fn set(mut self, path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        self.0.push((path.into(), value.into()));
        self
    }

    /// Returns `true` if there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the updates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(FieldPath, Value)> {
        self.0.iter()
    }
}

/// One operation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or fully overwrite a document.
    Set {
        collection: String,
        id: String,
        fields: Document,
    },
    /// Update fields of an existing document.
    Update {
        collection: String,
        id: String,
        updates: FieldUpdates,
    },
    /// Remove a document.
    Delete { collection: String, id: String },
}

/// Writes committed atomically: either all apply or none do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// An empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a full-document write.
    #[must_use]
    pub fn set(mut self, collection: impl Into<String>, id: impl Into<String>, fields: Document) -> Self {
        self.ops.push(WriteOp::Set {
            collection: collection.into(),
            id: id.into(),
            fields,
        });
        self
    }

    /// Queue a partial update.
    #[must_use]
    pub fn update(
        mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        updates: FieldUpdates,
    ) -> Self {
        self.ops.push(WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            updates,
        });
        self
    }

    /// Queue a delete.
    #[must_use]
    pub fn delete(mut self, collection: impl Into<String>, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        });
        self
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if no operation is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The queued operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

// =============================================================================
// DocumentStore
// =============================================================================

/// The hosted document database.
///
/// All type coercion is the caller's job; see [`fields`] and the entity
/// decoders in [`crate::models`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document.
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Run a one-shot query.
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>, StoreError>;

    /// Create or fully overwrite a document.
    async fn set_document(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError>;

    /// Update fields of an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] if the document does not exist.
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        updates: FieldUpdates,
    ) -> Result<(), StoreError>;

    /// Remove a document. Removing a missing document is not an error.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Apply every operation of `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Subscribe to a query.
    ///
    /// The first batch delivers the current result set as `Added` changes;
    /// later batches carry the changes caused by each write. Dropping the
    /// stream releases the listener.
    async fn subscribe(&self, query: Query) -> Result<ChangeStream, StoreError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    #[test]
    fn test_filter_equal() {
        let d = doc(json!({"customerId": "u1"}));
        assert!(Filter::equals("customerId", "u1").matches(&d));
        assert!(!Filter::equals("customerId", "u2").matches(&d));
        assert!(!Filter::equals("customerEmail", "u1").matches(&d));
    }

    #[test]
    fn test_filter_array_contains() {
        let d = doc(json!({"participants": ["a", "b"]}));
        assert!(Filter::array_contains("participants", "b").matches(&d));
        assert!(!Filter::array_contains("participants", "c").matches(&d));
    }

    #[test]
    fn test_filter_in() {
        let d = doc(json!({"role": "admin"}));
        assert!(Filter::is_in("role", vec![json!("admin"), json!("employee")]).matches(&d));
        assert!(!Filter::is_in("role", vec![json!("customer")]).matches(&d));
    }

    #[test]
    fn test_field_path_display() {
        let path = FieldPath::new(["unread", "buyer@shop.example"]);
        assert_eq!(path.segments().len(), 2);
        assert_eq!(path.to_string(), "unread.buyer@shop.example");
    }

    #[test]
    fn test_messages_collection() {
        assert_eq!(collections::messages("c1"), "chats/c1/messages");
    }

    #[test]
    fn test_transient_errors() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Rejected("rules".into()).is_transient());
    }
}
