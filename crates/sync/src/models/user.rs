//! User profiles.

use serde_json::{Value, json};
use url::Url;

use packline_core::{BrandId, Email, UserId, UserRole};

use super::{DecodeError, DocumentModel};
use crate::store::{Document, Snapshot, fields};

/// A brand a customer orders for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Brand {
    pub id: BrandId,
    pub name: String,
}

impl Brand {
    /// Create a brand reference.
    #[must_use]
    pub fn new(id: impl Into<BrandId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        let doc = value.as_object()?;
        Some(Self {
            id: BrandId::new(fields::non_empty_string(doc, "id")?),
            name: fields::string_or_default(doc, "name"),
        })
    }

    pub(crate) fn to_value(&self) -> Value {
        json!({"id": self.id.as_str(), "name": self.name})
    }
}

/// A user profile (`users/{id}`).
///
/// The id is the auth provider UID; profiles created before the migration
/// are keyed by email instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: Email,
    pub display_name: String,
    pub role: UserRole,
    pub brands: Vec<Brand>,
    pub profile_image_url: Option<Url>,
    /// Related accounts, e.g. an account manager's customers.
    pub related_ids: Vec<UserId>,
    /// Push delivery tokens of the user's devices.
    pub push_tokens: Vec<String>,
}

impl User {
    /// A new customer profile.
    #[must_use]
    pub fn new(id: UserId, email: Email, display_name: impl Into<String>) -> Self {
        Self {
            id,
            email,
            display_name: display_name.into(),
            role: UserRole::Customer,
            brands: Vec::new(),
            profile_image_url: None,
            related_ids: Vec::new(),
            push_tokens: Vec::new(),
        }
    }

    /// Set the role.
    #[must_use]
    pub const fn with_role(mut self, role: UserRole) -> Self {
        self.role = role;
        self
    }

    /// Whether this profile predates the UID migration.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        Email::is_email(self.id.as_str())
    }

    /// Name to show in lists; falls back to the email address.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            self.email.as_str()
        } else {
            &self.display_name
        }
    }

    /// Whether `needle` (already lowercased) occurs in the name or email.
    #[must_use]
    pub fn matches_search(&self, needle: &str) -> bool {
        needle.is_empty()
            || self.display_name.to_lowercase().contains(needle)
            || self.email.as_str().contains(needle)
    }
}

impl DocumentModel for User {
    const KIND: &'static str = "user";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }

    fn try_decode(snapshot: &Snapshot) -> Result<Self, DecodeError> {
        let doc = &snapshot.data;
        let raw_email = fields::string(doc, "email").ok_or(DecodeError::MissingField("email"))?;
        let email = Email::parse(&raw_email).map_err(|e| DecodeError::InvalidField {
            field: "email",
            reason: e.to_string(),
        })?;

        Ok(Self {
            id: UserId::new(snapshot.id.clone()),
            email,
            display_name: fields::string_or_default(doc, "displayName"),
            role: fields::parsed(doc, "role").unwrap_or_default(),
            brands: fields::array(doc, "brands")
                .map(|items| items.iter().filter_map(Brand::from_value).collect())
                .unwrap_or_default(),
            profile_image_url: fields::string(doc, "profileImageUrl")
                .and_then(|raw| Url::parse(&raw).ok()),
            related_ids: fields::string_list(doc, "relatedIds")
                .unwrap_or_default()
                .into_iter()
                .map(UserId::new)
                .collect(),
            push_tokens: fields::string_list(doc, "pushTokens").unwrap_or_default(),
        })
    }

    fn encode(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("id".into(), json!(self.id.as_str()));
        doc.insert("email".into(), json!(self.email.as_str()));
        doc.insert("displayName".into(), json!(self.display_name));
        doc.insert("role".into(), json!(self.role.as_str()));
        doc.insert(
            "brands".into(),
            Value::Array(self.brands.iter().map(Brand::to_value).collect()),
        );
        doc.insert(
            "profileImageUrl".into(),
            self.profile_image_url
                .as_ref()
                .map_or(Value::Null, |url| json!(url.as_str())),
        );
        doc.insert(
            "relatedIds".into(),
            json!(self.related_ids.iter().map(UserId::as_str).collect::<Vec<_>>()),
        );
        doc.insert("pushTokens".into(), json!(self.push_tokens));
        doc
    }
}
