//! Business logic services.
//!
//! # Services
//!
//! - `orders` - Order ledger: lifecycle, totals, attachments, customer lookups
//! - `conversations` - Chats, messages, unread tracking, topics, pagination
//! - `sync` - Live projections of the order and chat collections
//! - `users` - User directory, roles, push tokens, display names
//! - `notifications` - Push request dispatch and the push relay
//! - `search` - Debounced search-as-you-type

pub mod conversations;
pub mod notifications;
pub mod orders;
pub mod search;
pub mod sync;
pub mod users;

use packline_core::{Permission, UserId, UserRole};

use crate::error::{SyncResult, require};
use crate::models::User;

pub use conversations::{ChatTopic, ConversationRegistry, MessagePager, aggregate_topics};
pub use notifications::{
    NotificationDispatcher, PushError, PushPayload, PushRelay, PushSender, RecordingPushSender,
    RelayOutcome,
};
pub use orders::{NewOrder, OrderLedger};
pub use search::{DebouncedSearch, SearchResults};
pub use sync::{ChatFeed, ChatFeedView, Feed, OrderFeed, OrderFeedView, OrderScope, Projection, SyncCoordinator};
pub use users::{ProfileUpdate, UserDirectory};

/// Who is performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    pub id: UserId,
    pub role: UserRole,
}

impl Actor {
    /// An actor with an explicit role.
    #[must_use]
    pub fn new(id: impl Into<UserId>, role: UserRole) -> Self {
        Self { id: id.into(), role }
    }

    /// Fail with `PermissionDenied` unless this actor's role allows `permission`.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the role lacks the permission.
    pub fn require(&self, permission: Permission) -> SyncResult<()> {
        require(self.role, permission)
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            role: user.role,
        }
    }
}
