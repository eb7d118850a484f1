//! Orders, line items and attachments.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use url::Url;

use packline_core::{
    AttachmentId, AttachmentKind, BrandId, CustomerKeys, Email, Money, OrderId, OrderItemId,
    OrderStatus, ProductType, UserId,
};

use super::user::Brand;
use super::{DecodeError, DocumentModel};
use crate::store::{Document, Snapshot, fields};

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub name: String,
    /// Expected to be at least 1; not enforced.
    pub quantity: i64,
    /// Unit price. Negative only for discounts.
    pub price: Money,
    pub product_type: ProductType,
}

impl OrderItem {
    /// A new line item with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, quantity: i64, price: Money, product_type: ProductType) -> Self {
        Self {
            id: OrderItemId::generate(),
            name: name.into(),
            quantity,
            price,
            product_type,
        }
    }

    /// `price * quantity`, or `None` if the product overflows.
    #[must_use]
    pub fn line_total(&self) -> Option<Money> {
        self.price.checked_times(self.quantity)
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let doc = value.as_object().ok_or(DecodeError::MissingField("items"))?;
        let name = fields::string(doc, "name").ok_or(DecodeError::MissingField("items.name"))?;
        Ok(Self {
            id: fields::non_empty_string(doc, "id").map_or_else(OrderItemId::generate, OrderItemId::new),
            name,
            quantity: fields::integer(doc, "quantity").unwrap_or(0),
            price: fields::decimal(doc, "price").map(Money::new).unwrap_or(Money::ZERO),
            product_type: fields::parsed(doc, "productType").unwrap_or_default(),
        })
    }

    fn to_value(&self) -> Value {
        json!({
            "id": self.id.as_str(),
            "name": self.name,
            "quantity": self.quantity,
            "price": fields::decimal_value(self.price.amount()),
            "productType": self.product_type.as_str(),
        })
    }
}

/// A file attached to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAttachment {
    pub id: AttachmentId,
    pub url: Url,
    pub kind: AttachmentKind,
    /// Display name.
    pub name: String,
}

impl OrderAttachment {
    fn from_value(value: &Value) -> Option<Self> {
        let doc = value.as_object()?;
        let url = fields::string(doc, "url").and_then(|raw| Url::parse(&raw).ok())?;
        Some(Self {
            id: fields::non_empty_string(doc, "id").map_or_else(AttachmentId::generate, AttachmentId::new),
            url,
            kind: fields::parsed(doc, "type").unwrap_or_default(),
            name: fields::string_or_default(doc, "name"),
        })
    }

    fn to_value(&self) -> Value {
        json!({
            "id": self.id.as_str(),
            "url": self.url.as_str(),
            "type": self.kind.as_str(),
            "name": self.name,
        })
    }
}

/// An order (`orders/{id}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    /// Customer keys; at least one is present on every stored order.
    pub customer: CustomerKeys,
    pub account_manager_id: Option<UserId>,
    pub brand: Brand,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    /// Derived from `items`; see [`compute_total`].
    pub total_amount: Money,
    pub attachments: Vec<OrderAttachment>,
}

/// The order total: `price * quantity` summed over every item.
///
/// Tax and discount lines are ordinary items under this rule. The sum is
/// exact decimal arithmetic, so item order does not matter. Returns `None`
/// when a line or the running sum exceeds the decimal range.
#[must_use]
pub fn compute_total(items: &[OrderItem]) -> Option<Money> {
    items
        .iter()
        .map(OrderItem::line_total)
        .try_fold(Money::ZERO, |total, line| total.checked_add(line?))
}

impl Order {
    /// Whether the stored total agrees with the items.
    #[must_use]
    pub fn total_is_consistent(&self) -> bool {
        compute_total(&self.items) == Some(self.total_amount)
    }

    /// Whether `query` (already lowercased) matches the brand, a customer
    /// key, an item name or the order id.
    #[must_use]
    pub fn matches_search(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        let key_matches = self
            .customer
            .resolution_order()
            .iter()
            .any(|reference| reference.value().to_lowercase().contains(query));
        key_matches
            || self.brand.name.to_lowercase().contains(query)
            || self.id.as_str().contains(query)
            || self
                .items
                .iter()
                .any(|item| item.name.to_lowercase().contains(query))
    }
}

impl DocumentModel for Order {
    const KIND: &'static str = "order";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }

    fn try_decode(snapshot: &Snapshot) -> Result<Self, DecodeError> {
        let doc = &snapshot.data;
        let customer = CustomerKeys {
            uid: fields::non_empty_string(doc, "customerId").map(UserId::new),
            email: fields::string(doc, "customerEmail").and_then(|raw| Email::parse(&raw).ok()),
        };
        if customer.is_empty() {
            return Err(DecodeError::MissingField("customerId"));
        }

        let items = fields::array(doc, "items")
            .map(|raw| raw.iter().map(OrderItem::from_value).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        let total_amount = match fields::decimal(doc, "totalAmount") {
            Some(amount) => Money::new(amount),
            None => compute_total(&items).ok_or_else(|| DecodeError::InvalidField {
                field: "items",
                reason: "order total overflows".into(),
            })?,
        };

        Ok(Self {
            id: OrderId::new(snapshot.id.clone()),
            customer,
            account_manager_id: fields::non_empty_string(doc, "accountManagerId").map(UserId::new),
            brand: Brand {
                id: BrandId::new(fields::string_or_default(doc, "brandId")),
                name: fields::string_or_default(doc, "brandName"),
            },
            items,
            status: fields::parsed(doc, "status").unwrap_or_default(),
            created_at: fields::timestamp(doc, "createdAt").unwrap_or_else(fields::now),
            total_amount,
            attachments: fields::array(doc, "attachments")
                .map(|raw| raw.iter().filter_map(OrderAttachment::from_value).collect())
                .unwrap_or_default(),
        })
    }

    fn encode(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("id".into(), json!(self.id.as_str()));
        doc.insert(
            "customerId".into(),
            self.customer.uid.as_ref().map_or(Value::Null, |uid| json!(uid.as_str())),
        );
        doc.insert(
            "customerEmail".into(),
            self.customer
                .email
                .as_ref()
                .map_or(Value::Null, |email| json!(email.as_str())),
        );
        doc.insert(
            "accountManagerId".into(),
            self.account_manager_id
                .as_ref()
                .map_or(Value::Null, |id| json!(id.as_str())),
        );
        doc.insert("brandId".into(), json!(self.brand.id.as_str()));
        doc.insert("brandName".into(), json!(self.brand.name));
        doc.insert("items".into(), encode_items(&self.items));
        doc.insert("status".into(), json!(self.status.as_str()));
        doc.insert("createdAt".into(), fields::timestamp_value(self.created_at));
        doc.insert("totalAmount".into(), fields::decimal_value(self.total_amount.amount()));
        doc.insert("attachments".into(), encode_attachments(&self.attachments));
        doc
    }
}

/// The stored form of an item list.
#[must_use]
pub fn encode_items(items: &[OrderItem]) -> Value {
    Value::Array(items.iter().map(OrderItem::to_value).collect())
}

/// The stored form of an attachment list.
#[must_use]
pub fn encode_attachments(attachments: &[OrderAttachment]) -> Value {
    Value::Array(attachments.iter().map(OrderAttachment::to_value).collect())
}
