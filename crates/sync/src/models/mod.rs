//! Entity model.
//!
//! In-memory shapes of the store's documents and their decode/encode
//! contract:
//!
//! - Decoding is lenient. Optional fields fall back to defaults; only a
//!   missing or mistyped *mandatory* field rejects a document, and a rejected
//!   document is logged and skipped rather than failing a batch.
//! - Encoding is total and always writes every core field, so writing an
//!   entity back is an idempotent overwrite.
//!
//! These structs are caches of store documents, never the source of truth.

pub mod chat;
pub mod order;
pub mod user;

use thiserror::Error;
use tracing::warn;

use crate::store::{Document, Snapshot};

pub use chat::{Chat, ChatMessage, MessageContent};
pub use order::{Order, OrderAttachment, OrderItem};
pub use user::{Brand, User};

/// Why a document could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A mandatory field is absent or has the wrong type.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A mandatory field is present but its value is unusable.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// An entity stored as one document.
pub trait DocumentModel: Sized {
    /// Human-readable entity name for logs.
    const KIND: &'static str;

    /// The document id this entity is stored under.
    fn document_id(&self) -> &str;

    /// Decode a snapshot, reporting why it was rejected.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` when a mandatory field is absent or unusable.
    fn try_decode(snapshot: &Snapshot) -> Result<Self, DecodeError>;

    /// Encode every core field.
    fn encode(&self) -> Document;

    /// Decode a snapshot, logging and returning `None` on failure.
    fn decode(snapshot: &Snapshot) -> Option<Self> {
        match Self::try_decode(snapshot) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(kind = Self::KIND, id = %snapshot.id, error = %e, "Skipping malformed document");
                None
            }
        }
    }
}

/// Decode a bulk result, dropping malformed records.
pub fn decode_all<T, I>(snapshots: I) -> Vec<T>
where
    T: DocumentModel,
    I: IntoIterator<Item = Snapshot>,
{
    snapshots
        .into_iter()
        .filter_map(|snapshot| T::decode(&snapshot))
        .collect()
}
