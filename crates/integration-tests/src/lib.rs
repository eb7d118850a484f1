//! Scenario tests for Packline.
//!
//! Every test runs against the in-process backends (`MemoryStore`,
//! `MemoryAuth`, `MemoryBlobStorage`, `RecordingPushSender`), so no external
//! services are needed:
//!
//! ```bash
//! cargo test -p packline-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `orders` - Order lifecycle, totals, customer lookups
//! - `conversations` - Chats, unread state, notifications
//! - `feeds` - Live projections and listener lifecycle

use std::sync::Arc;

use rust_decimal::Decimal;

use packline_core::{Email, Money, ProductType, UserId, UserRole};
use packline_sync::auth::{Identity, MemoryAuth};
use packline_sync::blob::MemoryBlobStorage;
use packline_sync::models::{DocumentModel, OrderItem, User};
use packline_sync::services::RecordingPushSender;
use packline_sync::store::collections;
use packline_sync::{
    Actor, Backends, ConversationRegistry, DocumentStore, MemoryStore, OrderLedger, PushRelay,
    SyncConfig, SyncCoordinator, SyncState, UserDirectory,
};

/// Every service wired to shared in-memory backends.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub auth: Arc<MemoryAuth>,
    pub blobs: Arc<MemoryBlobStorage>,
    pub push: Arc<RecordingPushSender>,
    pub state: SyncState,
    pub directory: Arc<UserDirectory>,
    pub ledger: Arc<OrderLedger>,
    pub registry: Arc<ConversationRegistry>,
    pub coordinator: Arc<SyncCoordinator>,
    pub relay: Arc<PushRelay>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    /// Fresh backends with the default configuration and nobody signed in.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    /// Fresh backends with services built from `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configured bucket name is rejected.
    #[must_use]
    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(MemoryAuth::new());
        let blobs = Arc::new(MemoryBlobStorage::for_bucket(&config.storage_bucket).expect("valid bucket"));
        let push = Arc::new(RecordingPushSender::new());

        let state = SyncState::new(
            config,
            Backends {
                store: store.clone(),
                auth: auth.clone(),
                blobs: blobs.clone(),
                push: push.clone(),
            },
        );

        Self {
            directory: state.directory().clone(),
            ledger: state.ledger().clone(),
            registry: state.registry().clone(),
            coordinator: state.coordinator().clone(),
            relay: state.relay().clone(),
            store,
            auth,
            blobs,
            push,
            state,
        }
    }

    /// Write a user profile straight to the store.
    ///
    /// # Panics
    ///
    /// Panics on an invalid email or a store failure.
    pub async fn seed_user(&self, id: &str, email: &str, name: &str, role: UserRole) -> User {
        let user = User::new(UserId::new(id), Email::parse(email).expect("valid email"), name).with_role(role);
        self.store
            .set_document(collections::USERS, id, user.encode())
            .await
            .expect("seed user");
        user
    }

    /// Make `user` the signed-in identity and return them as an actor.
    pub fn sign_in(&self, user: &User) -> Actor {
        self.auth.sign_in_as(Identity {
            id: user.id.clone(),
            email: user.email.clone(),
        });
        Actor::from(user)
    }
}

/// An order item priced in cents.
#[must_use]
pub fn item(name: &str, quantity: i64, cents: i64, product_type: ProductType) -> OrderItem {
    OrderItem::new(name, quantity, Money::from_cents(cents), product_type)
}

/// Parse a decimal literal.
///
/// # Panics
///
/// Panics on a malformed literal.
#[must_use]
pub fn dec(value: &str) -> Decimal {
    value.parse().expect("decimal literal")
}
