//! Status and kind enums for orders, items, attachments and chats.
//!
//! Every enum here is stored in documents as its camelCase string
//! (`"inProgress"`, `"qpBag"`, ...). Unknown strings fail to parse; the
//! entity decoders then substitute the documented default.

use serde::{Deserialize, Serialize};

/// Error returned when a stored string does not name a known variant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value}")]
pub struct UnknownVariant {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` from one variant table so the
/// stored spelling is defined in exactly one place.
macro_rules! stored_names {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// All variants, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The string stored in documents.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl ::core::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::core::str::FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use stored_names;

/// Order lifecycle status.
///
/// This is a flat enum: any status may follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    #[default]
    Pending,
    InProgress,
    Flagged,
    Completed,
}

stored_names!(OrderStatus, "order status", {
    Pending => "pending",
    InProgress => "inProgress",
    Flagged => "flagged",
    Completed => "completed",
});

/// What an order line item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProductType {
    Bag,
    QpBag,
    #[default]
    Sticker,
    /// Tax line; created with quantity 1.
    Tax,
    /// Discount line; carries a negative price.
    Discount,
}

stored_names!(ProductType, "product type", {
    Bag => "bag",
    QpBag => "qpBag",
    Sticker => "sticker",
    Tax => "tax",
    Discount => "discount",
});

impl ProductType {
    /// Tax and discount lines adjust the total rather than describe goods.
    #[must_use]
    pub const fn is_adjustment(&self) -> bool {
        matches!(self, Self::Tax | Self::Discount)
    }
}

/// File type of an order attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentKind {
    #[default]
    Image,
    Pdf,
}

stored_names!(AttachmentKind, "attachment type", {
    Image => "image",
    Pdf => "pdf",
});

impl AttachmentKind {
    /// Classify an uploaded file by its MIME type.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.eq_ignore_ascii_case("application/pdf") {
            Self::Pdf
        } else {
            Self::Image
        }
    }
}

/// Media type of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    Text,
    Image,
    Video,
    Pdf,
}

stored_names!(MediaKind, "media type", {
    Text => "text",
    Image => "image",
    Video => "video",
    Pdf => "pdf",
});

impl MediaKind {
    /// Classify an uploaded file by its MIME type.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Self {
        let lower = content_type.to_ascii_lowercase();
        if lower == "application/pdf" {
            Self::Pdf
        } else if lower.starts_with("video/") {
            Self::Video
        } else if lower.starts_with("text/") {
            Self::Text
        } else {
            Self::Image
        }
    }
}

/// Audience of a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChatKind {
    /// Staff-only conversation.
    Team,
    /// Conversation between a customer and staff.
    #[default]
    Customer,
}

stored_names!(ChatKind, "chat type", {
    Team => "team",
    Customer => "customer",
});
