//! Unified error handling for the sync layer.

use thiserror::Error;

use packline_core::{Permission, UserRole};

use crate::auth::AuthError;
use crate::blob::BlobError;
use crate::models::DecodeError;
use crate::services::PushError;
use crate::store::StoreError;

/// Result alias for ledger, registry and directory operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type returned by every single-entity operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Input rejected before any write.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The actor's role does not grant the permission.
    #[error("Permission denied: {role} cannot {permission}")]
    PermissionDenied {
        /// Role of the caller.
        role: UserRole,
        /// What was attempted.
        permission: Permission,
    },

    /// An expected document is absent.
    #[error("Not found: {kind} {id}")]
    NotFound {
        /// Entity kind (`order`, `chat`, `user`).
        kind: &'static str,
        /// Document id.
        id: String,
    },

    /// A single document has an unexpected shape.
    #[error("Malformed {kind} {id}: {source}")]
    Decode {
        kind: &'static str,
        id: String,
        #[source]
        source: DecodeError,
    },

    /// Network or backend failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// No usable identity, or the auth provider refused.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Blob upload or URL resolution failed.
    #[error("Storage error: {0}")]
    Blob(#[from] BlobError),

    /// The push platform refused or could not be reached.
    #[error("Push error: {0}")]
    Push(#[from] PushError),

    /// The caller cancelled the operation before it finished.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Shorthand for [`SyncError::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for [`SyncError::NotFound`].
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Map a store `NotFound` onto the entity the caller was working on.
    #[must_use]
    pub fn from_store(error: StoreError, kind: &'static str, id: &str) -> Self {
        match error {
            StoreError::NotFound { .. } => Self::not_found(kind, id),
            other => Self::Store(other),
        }
    }

    /// Whether the user may get a different outcome by trying again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Blob(BlobError::Unavailable(_)) | Self::Push(PushError::Unavailable(_)) => true,
            _ => false,
        }
    }

    /// Description for a dismissible error message.
    ///
    /// Backend details are not shown to users.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Store(e) if e.is_transient() => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            Self::Store(_) | Self::Decode { .. } => "Something went wrong. Please try again.".to_string(),
            Self::Blob(_) => "The file could not be uploaded. Please try again.".to_string(),
            Self::PermissionDenied { .. } => "You don't have permission to do that.".to_string(),
            Self::Push(_) => "The notification could not be delivered.".to_string(),
            Self::Auth(_) => "Please sign in again.".to_string(),
            Self::Validation(message) => message.clone(),
            Self::NotFound { kind, .. } => format!("This {kind} no longer exists."),
            Self::Cancelled => String::new(),
        }
    }
}

/// Fail with [`SyncError::PermissionDenied`] unless `role` allows `permission`.
///
/// # Errors
///
/// Returns `PermissionDenied` when the role lacks the permission.
pub fn require(role: UserRole, permission: Permission) -> SyncResult<()> {
    if role.allows(permission) {
        Ok(())
    } else {
        Err(SyncError::PermissionDenied { role, permission })
    }
}
