//! Services wired together from one configuration.

use std::sync::Arc;

use crate::auth::AuthProvider;
use crate::blob::BlobStorage;
use crate::config::SyncConfig;
use crate::services::{
    ConversationRegistry, NotificationDispatcher, OrderLedger, PushRelay, PushSender,
    SyncCoordinator, UserDirectory,
};
use crate::store::DocumentStore;

/// The external systems every service talks to.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub blobs: Arc<dyn BlobStorage>,
    pub push: Arc<dyn PushSender>,
}

/// Every service, sharing one set of backends.
///
/// Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct SyncState {
    inner: Arc<SyncStateInner>,
}

struct SyncStateInner {
    config: SyncConfig,
    directory: Arc<UserDirectory>,
    ledger: Arc<OrderLedger>,
    registry: Arc<ConversationRegistry>,
    coordinator: Arc<SyncCoordinator>,
    relay: Arc<PushRelay>,
}

impl SyncState {
    /// Build every service from `config` over `backends`.
    #[must_use]
    pub fn new(config: SyncConfig, backends: Backends) -> Self {
        let Backends {
            store,
            auth,
            blobs,
            push,
        } = backends;

        let directory = Arc::new(
            UserDirectory::new(store.clone(), auth.clone(), config.name_cache)
                .with_search_debounce(config.search_debounce),
        );
        let dispatcher = Arc::new(NotificationDispatcher::new(store.clone(), directory.clone()));
        let ledger = Arc::new(
            OrderLedger::new(store.clone(), auth, blobs.clone())
                .with_search_debounce(config.search_debounce),
        );
        let registry = Arc::new(
            ConversationRegistry::new(store.clone(), blobs)
                .with_notifications(dispatcher)
                .with_page_size(config.page_size),
        );
        let coordinator = Arc::new(SyncCoordinator::new(store.clone()));
        let relay = Arc::new(PushRelay::new(store, push));

        Self {
            inner: Arc::new(SyncStateInner {
                config,
                directory,
                ledger,
                registry,
                coordinator,
                relay,
            }),
        }
    }

    /// The configuration the services were built from.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<UserDirectory> {
        &self.inner.directory
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<OrderLedger> {
        &self.inner.ledger
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.inner.coordinator
    }

    #[must_use]
    pub fn relay(&self) -> &Arc<PushRelay> {
        &self.inner.relay
    }
}
