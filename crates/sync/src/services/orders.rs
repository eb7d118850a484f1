//! Order ledger.
//!
//! Owns order creation, item and attachment edits, status changes, deletion
//! and the order query surface. Role checks happen here, before any store
//! call; the store does not enforce them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use packline_core::{
    AttachmentId, AttachmentKind, CustomerKeys, CustomerRef, Money, OrderId, OrderStatus,
    Permission, UserId,
};

use super::Actor;
use super::search::{DEFAULT_SEARCH_DEBOUNCE, DebouncedSearch};
use crate::auth::AuthProvider;
use crate::blob::BlobStorage;
use crate::error::{SyncError, SyncResult};
use crate::models::order::{compute_total, encode_attachments, encode_items};
use crate::models::{Brand, DocumentModel, Order, OrderAttachment, OrderItem, decode_all};
use crate::store::{DocumentStore, FieldUpdates, Filter, Query, StoreError, collections, fields};

/// Input for [`OrderLedger::create_order`].
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: CustomerKeys,
    pub account_manager_id: Option<UserId>,
    pub brand: Brand,
    pub items: Vec<OrderItem>,
    pub attachments: Vec<OrderAttachment>,
}

/// Order lifecycle and lookups.
pub struct OrderLedger {
    store: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    blobs: Arc<dyn BlobStorage>,
    search_debounce: Duration,
}

impl OrderLedger {
    /// Create a ledger over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        auth: Arc<dyn AuthProvider>,
        blobs: Arc<dyn BlobStorage>,
    ) -> Self {
        Self {
            store,
            auth,
            blobs,
            search_debounce: DEFAULT_SEARCH_DEBOUNCE,
        }
    }

    /// Override the delay used by [`OrderLedger::debounced_search`].
    #[must_use]
    pub fn with_search_debounce(mut self, delay: Duration) -> Self {
        self.search_debounce = delay;
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create and persist a pending order.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the customer reference or the item list is
    /// empty or the total overflows, `PermissionDenied` if the actor may not create orders (or is a
    /// customer ordering for someone else), or a store error.
    #[instrument(skip(self, actor, order), fields(actor = %actor.id, items = order.items.len()))]
    pub async fn create_order(&self, actor: &Actor, order: NewOrder) -> SyncResult<Order> {
        actor.require(Permission::CreateOrder)?;
        if order.customer.is_empty() {
            return Err(SyncError::validation("an order needs a customer"));
        }
        if order.items.is_empty() {
            return Err(SyncError::validation("an order needs at least one item"));
        }
        if !actor.role.is_staff() && !is_same_customer(&order.customer, &actor.id) {
            return Err(SyncError::PermissionDenied {
                role: actor.role,
                permission: Permission::CreateOrder,
            });
        }
        let total_amount = checked_total(&order.items)?;

        let created = Order {
            id: OrderId::generate(),
            customer: order.customer,
            account_manager_id: order.account_manager_id,
            brand: order.brand,
            total_amount,
            items: order.items,
            status: OrderStatus::Pending,
            created_at: fields::now(),
            attachments: order.attachments,
        };

        self.store
            .set_document(collections::ORDERS, created.id.as_str(), created.encode())
            .await?;

        info!(order_id = %created.id, total = %created.total_amount, "Order created");
        Ok(created)
    }

    /// Change an order's status. Any status may follow any other.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `NotFound` if the order was deleted, or a
    /// store error.
    #[instrument(skip(self, actor, order, status), fields(order_id = %order.id, status = %status))]
    pub async fn update_status(&self, actor: &Actor, order: &Order, status: OrderStatus) -> SyncResult<Order> {
        actor.require(Permission::UpdateOrderStatus)?;

        let updates = FieldUpdates::new().set("status", status.as_str());
        self.update(order, updates).await?;

        info!(from = %order.status, "Order status updated");
        Ok(Order {
            status,
            ..order.clone()
        })
    }

    /// Replace an order's items and recompute its total in one write.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `Validation` for an empty item list or an
    /// overflowing total, `NotFound`, or a store error.
    #[instrument(skip(self, actor, order, items), fields(order_id = %order.id, items = items.len()))]
    pub async fn edit_items(&self, actor: &Actor, order: &Order, items: Vec<OrderItem>) -> SyncResult<Order> {
        actor.require(Permission::EditOrder)?;
        if items.is_empty() {
            return Err(SyncError::validation("an order needs at least one item"));
        }

        let total_amount = checked_total(&items)?;
        let updates = FieldUpdates::new()
            .set("items", encode_items(&items))
            .set("totalAmount", fields::decimal_value(total_amount.amount()));
        self.update(order, updates).await?;

        info!(total = %total_amount, "Order items replaced");
        Ok(Order {
            items,
            total_amount,
            ..order.clone()
        })
    }

    /// Delete an order. Admins and account managers only.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` before touching the store, or a store error.
    #[instrument(skip(self, actor, order), fields(order_id = %order.id, actor = %actor.id))]
    pub async fn delete_order(&self, actor: &Actor, order: &Order) -> SyncResult<()> {
        actor.require(Permission::DeleteOrder)?;
        self.store
            .delete_document(collections::ORDERS, order.id.as_str())
            .await?;
        info!("Order deleted");
        Ok(())
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Upload a file and attach it to an order.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `Validation` for an empty file, a blob
    /// error, `NotFound`, or a store error.
    #[instrument(skip(self, actor, order, bytes), fields(order_id = %order.id, size = bytes.len()))]
    pub async fn attach_file(
        &self,
        actor: &Actor,
        order: &Order,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> SyncResult<Order> {
        actor.require(Permission::EditOrder)?;
        if bytes.is_empty() {
            return Err(SyncError::validation("cannot attach an empty file"));
        }

        let name = sanitize_file_name(file_name);
        let path = format!("orders/{}/{}-{name}", order.id, uuid::Uuid::new_v4());
        self.blobs.upload(&path, bytes, content_type).await?;
        let url = self.blobs.download_url(&path).await?;

        let mut attachments = order.attachments.clone();
        attachments.push(OrderAttachment {
            id: AttachmentId::generate(),
            url,
            kind: AttachmentKind::from_content_type(content_type),
            name,
        });
        self.update(
            order,
            FieldUpdates::new().set("attachments", encode_attachments(&attachments)),
        )
        .await?;

        info!(path = %path, "Attachment added");
        Ok(Order {
            attachments,
            ..order.clone()
        })
    }

    /// Remove one attachment from an order. The blob itself is kept.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `NotFound` if the order has no such
    /// attachment, or a store error.
    #[instrument(skip(self, actor, order), fields(order_id = %order.id))]
    pub async fn remove_attachment(
        &self,
        actor: &Actor,
        order: &Order,
        attachment_id: &AttachmentId,
    ) -> SyncResult<Order> {
        actor.require(Permission::EditOrder)?;

        let mut attachments = order.attachments.clone();
        let before = attachments.len();
        attachments.retain(|attachment| &attachment.id != attachment_id);
        if attachments.len() == before {
            return Err(SyncError::not_found("attachment", attachment_id.as_str()));
        }

        self.update(
            order,
            FieldUpdates::new().set("attachments", encode_attachments(&attachments)),
        )
        .await?;
        Ok(Order {
            attachments,
            ..order.clone()
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetch one order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent, `Decode` if malformed, or a store error.
    pub async fn get_order(&self, id: &OrderId) -> SyncResult<Order> {
        let snapshot = self
            .store
            .get_document(collections::ORDERS, id.as_str())
            .await?
            .ok_or_else(|| SyncError::not_found(Order::KIND, id.as_str()))?;
        Order::try_decode(&snapshot).map_err(|source| SyncError::Decode {
            kind: Order::KIND,
            id: snapshot.id.clone(),
            source,
        })
    }

    /// Every order, newest first. Staff only.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or a store error.
    pub async fn fetch_all_orders(&self, actor: &Actor) -> SyncResult<Vec<Order>> {
        actor.require(Permission::ViewAllOrders)?;
        let query = Query::collection(collections::ORDERS).order_by_desc("createdAt");
        Ok(decode_all(self.store.query(&query).await?))
    }

    /// Orders of the customers an account manager looks after, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn fetch_orders_for_manager(&self, manager: &UserId) -> SyncResult<Vec<Order>> {
        let query = Query::collection(collections::ORDERS)
            .filter(Filter::equals("accountManagerId", manager.as_str()))
            .order_by_desc("createdAt");
        Ok(decode_all(self.store.query(&query).await?))
    }

    /// Orders of one customer, newest first.
    ///
    /// When `keys` belong to the signed-in identity, the lookup falls back
    /// from the UID key to the email key if the UID query is empty or fails.
    /// Other customers are looked up by their primary key only. An error is
    /// returned only when every attempted lookup failed.
    ///
    /// The email lookup is an exact match on the normalized (lowercase)
    /// address that [`packline_core::Email`] produces and every order written here stores.
    /// Legacy documents whose `customerEmail` kept mixed case are not found
    /// by it.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `keys` is empty, or the last store error when
    /// every lookup failed.
    #[instrument(skip(self, keys), fields(customer = ?keys.primary().map(|r| r.to_string())))]
    pub async fn fetch_orders_for_customer(&self, keys: &CustomerKeys) -> SyncResult<Vec<Order>> {
        let attempts = self.lookup_plan(keys);
        if attempts.is_empty() {
            return Err(SyncError::validation("no customer key to look up"));
        }

        let mut last_error: Option<StoreError> = None;
        let mut any_succeeded = false;
        for reference in &attempts {
            match self.query_customer_orders(reference).await {
                Ok(orders) if !orders.is_empty() => return Ok(orders),
                Ok(_) => {
                    debug!(key = %reference, "No orders under key, trying next");
                    any_succeeded = true;
                }
                Err(e) => {
                    debug!(key = %reference, error = %e, "Order lookup failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_succeeded => Err(e.into()),
            _ => Ok(Vec::new()),
        }
    }

    /// Orders matching a search text (case-insensitive). Staff search every
    /// order; everyone else searches their own.
    ///
    /// # Errors
    ///
    /// Returns `Auth` if a non-staff actor is not signed in, or a store error.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn search_orders(&self, actor: &Actor, text: &str) -> SyncResult<Vec<Order>> {
        let needle = text.trim().to_lowercase();
        let orders = if actor.role.allows(Permission::ViewAllOrders) {
            self.fetch_all_orders(actor).await?
        } else {
            let identity = crate::auth::require_identity(self.auth.as_ref())?;
            self.fetch_orders_for_customer(&CustomerKeys::new(identity.id, identity.email))
                .await?
        };
        Ok(orders
            .into_iter()
            .filter(|order| order.matches_search(&needle))
            .collect())
    }

    /// A debounced search box over [`OrderLedger::search_orders`].
    #[must_use]
    pub fn debounced_search(self: &Arc<Self>, actor: Actor) -> DebouncedSearch<Order> {
        let ledger = Arc::clone(self);
        DebouncedSearch::new(self.search_debounce, move |text: String| {
            let ledger = Arc::clone(&ledger);
            let actor = actor.clone();
            async move { ledger.search_orders(&actor, &text).await }
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn update(&self, order: &Order, updates: FieldUpdates) -> SyncResult<()> {
        self.store
            .update_fields(collections::ORDERS, order.id.as_str(), updates)
            .await
            .map_err(|e| SyncError::from_store(e, Order::KIND, order.id.as_str()))
    }

    async fn query_customer_orders(&self, reference: &CustomerRef) -> Result<Vec<Order>, StoreError> {
        let query = Query::collection(collections::ORDERS)
            .filter(Filter::equals(reference.order_field(), json!(reference.value())))
            .order_by_desc("createdAt");
        Ok(decode_all(self.store.query(&query).await?))
    }

    /// Keys to try, in order.
    fn lookup_plan(&self, keys: &CustomerKeys) -> Vec<CustomerRef> {
        let Some(identity) = self.auth.current_identity() else {
            return keys.primary().into_iter().collect();
        };
        let is_current = keys.uid.as_ref() == Some(&identity.id) || keys.email.as_ref() == Some(&identity.email);
        if !is_current {
            return keys.primary().into_iter().collect();
        }

        let mut plan = keys.resolution_order();
        let fallback = CustomerRef::ByEmail(identity.email);
        if !plan.contains(&fallback) {
            plan.push(fallback);
        }
        plan
    }
}

/// Whether `keys` name the customer `id` (by UID or legacy email id).
fn is_same_customer(keys: &CustomerKeys, id: &UserId) -> bool {
    keys.uid.as_ref() == Some(id) || keys.email.as_ref().is_some_and(|email| email.as_str() == id.as_str())
}

/// The order total, or `Validation` when it exceeds the decimal range.
fn checked_total(items: &[OrderItem]) -> SyncResult<Money> {
    compute_total(items).ok_or_else(|| SyncError::validation("order total is too large"))
}

/// Keep a file name safe for use as one path segment.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        warn!(original = name, "Unusable file name, using default");
        "file".to_string()
    } else {
        cleaned
    }
}
