//! Customer references.
//!
//! Orders have historically been keyed by the customer's email. New orders
//! also carry the auth provider UID. Until every document is migrated, an
//! order is found through either key, so the two are modeled explicitly
//! instead of as interchangeable strings.

use core::fmt;

use serde::{Deserialize, Serialize};

use super::email::Email;
use super::id::UserId;

/// One way of referring to a customer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "camelCase")]
pub enum CustomerRef {
    /// Legacy key: the customer's email address.
    ByEmail(Email),
    /// Current key: the auth provider UID.
    ByUid(UserId),
}

impl CustomerRef {
    /// The order document field this reference is matched against.
    #[must_use]
    pub const fn order_field(&self) -> &'static str {
        match self {
            Self::ByEmail(_) => "customerEmail",
            Self::ByUid(_) => "customerId",
        }
    }

    /// The raw key value.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::ByEmail(email) => email.as_str(),
            Self::ByUid(uid) => uid.as_str(),
        }
    }
}

impl fmt::Display for CustomerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByEmail(email) => write!(f, "email:{email}"),
            Self::ByUid(uid) => write!(f, "uid:{uid}"),
        }
    }
}

/// Every key known for one customer.
///
/// Orders store both keys when available; lookups try them in
/// [`CustomerKeys::resolution_order`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerKeys {
    /// Auth provider UID, if the customer has been migrated.
    pub uid: Option<UserId>,
    /// Email address, if known.
    pub email: Option<Email>,
}

impl CustomerKeys {
    /// Keys for a fully migrated customer.
    #[must_use]
    pub const fn new(uid: UserId, email: Email) -> Self {
        Self {
            uid: Some(uid),
            email: Some(email),
        }
    }

    /// Keys for a customer known only by UID.
    #[must_use]
    pub const fn uid_only(uid: UserId) -> Self {
        Self {
            uid: Some(uid),
            email: None,
        }
    }

    /// Keys for a legacy customer known only by email.
    #[must_use]
    pub const fn email_only(email: Email) -> Self {
        Self {
            uid: None,
            email: Some(email),
        }
    }

    /// Returns `true` if no key is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.uid.is_none() && self.email.is_none()
    }

    /// References in lookup order: UID first, then email.
    #[must_use]
    pub fn resolution_order(&self) -> Vec<CustomerRef> {
        let mut refs = Vec::with_capacity(2);
        if let Some(uid) = &self.uid {
            refs.push(CustomerRef::ByUid(uid.clone()));
        }
        if let Some(email) = &self.email {
            refs.push(CustomerRef::ByEmail(email.clone()));
        }
        refs
    }

    /// The preferred single reference (UID when present).
    #[must_use]
    pub fn primary(&self) -> Option<CustomerRef> {
        self.resolution_order().into_iter().next()
    }

    /// Whether `reference` names this customer.
    #[must_use]
    pub fn matches(&self, reference: &CustomerRef) -> bool {
        match reference {
            CustomerRef::ByUid(uid) => self.uid.as_ref() == Some(uid),
            CustomerRef::ByEmail(email) => self.email.as_ref() == Some(email),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn email() -> Email {
        Email::parse("buyer@shop.example").unwrap()
    }

    #[test]
    fn test_resolution_order_prefers_uid() {
        let keys = CustomerKeys::new(UserId::new("uid-1"), email());
        assert_eq!(
            keys.resolution_order(),
            vec![
                CustomerRef::ByUid(UserId::new("uid-1")),
                CustomerRef::ByEmail(email()),
            ]
        );
        assert_eq!(keys.primary(), Some(CustomerRef::ByUid(UserId::new("uid-1"))));
    }

    #[test]
    fn test_legacy_keys() {
        let keys = CustomerKeys::email_only(email());
        assert_eq!(keys.resolution_order(), vec![CustomerRef::ByEmail(email())]);
        assert!(!keys.is_empty());
        assert!(CustomerKeys::default().is_empty());
    }

    #[test]
    fn test_order_field_and_matches() {
        let by_email = CustomerRef::ByEmail(email());
        assert_eq!(by_email.order_field(), "customerEmail");
        assert_eq!(by_email.value(), "buyer@shop.example");
        assert!(CustomerKeys::email_only(email()).matches(&by_email));
        assert!(!CustomerKeys::uid_only(UserId::new("x")).matches(&by_email));
    }
}
