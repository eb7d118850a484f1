//! User directory.
//!
//! Profiles, roles, push tokens and display-name resolution. Display names
//! are cached with `moka` so chat lists do not fetch the same profile for
//! every row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use moka::future::Cache;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use packline_core::{Email, Permission, UserId, UserRole};

use super::Actor;
use super::search::{DEFAULT_SEARCH_DEBOUNCE, DebouncedSearch};
use crate::auth::AuthProvider;
use crate::config::NameCacheConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Brand, DocumentModel, User, decode_all};
use crate::store::{DocumentStore, FieldUpdates, Filter, Query, collections};

/// Profile fields a user may change about themselves. `None` leaves the
/// field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub profile_image_url: Option<Url>,
    pub brands: Option<Vec<Brand>>,
}

impl ProfileUpdate {
    fn into_updates(self) -> SyncResult<FieldUpdates> {
        let mut updates = FieldUpdates::new();
        if let Some(name) = self.display_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(SyncError::validation("display name cannot be empty"));
            }
            updates = updates.set("displayName", name);
        }
        if let Some(url) = self.profile_image_url {
            updates = updates.set("profileImageUrl", url.as_str());
        }
        if let Some(brands) = self.brands {
            updates = updates.set(
                "brands",
                Value::Array(brands.iter().map(Brand::to_value).collect()),
            );
        }
        Ok(updates)
    }
}

/// Profiles and display names.
pub struct UserDirectory {
    store: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    names: Cache<UserId, String>,
    search_debounce: Duration,
}

impl UserDirectory {
    /// Create a directory with a display-name cache sized by `cache`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, auth: Arc<dyn AuthProvider>, cache: NameCacheConfig) -> Self {
        let names = Cache::builder()
            .max_capacity(cache.capacity)
            .time_to_live(cache.ttl)
            .build();
        Self {
            store,
            auth,
            names,
            search_debounce: DEFAULT_SEARCH_DEBOUNCE,
        }
    }

    /// Override the delay used by [`UserDirectory::debounced_search`].
    #[must_use]
    pub fn with_search_debounce(mut self, delay: Duration) -> Self {
        self.search_debounce = delay;
        self
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Find a profile by document id, falling back to the `email` field for
    /// ids that are email addresses (legacy keys and not-yet-migrated
    /// references).
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn find_user(&self, id: &UserId) -> SyncResult<Option<User>> {
        if let Some(snapshot) = self.store.get_document(collections::USERS, id.as_str()).await? {
            return Ok(User::decode(&snapshot));
        }
        let Ok(email) = Email::parse(id.as_str()) else {
            return Ok(None);
        };
        let query = Query::collection(collections::USERS)
            .filter(Filter::equals("email", email.as_str()))
            .limit(1);
        Ok(decode_all::<User, _>(self.store.query(&query).await?).into_iter().next())
    }

    /// Fetch a profile that must exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or a store error.
    pub async fn get_user(&self, id: &UserId) -> SyncResult<User> {
        self.find_user(id)
            .await?
            .ok_or_else(|| SyncError::not_found(User::KIND, id.as_str()))
    }

    /// Every user with `role`, sorted by label.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn users_with_role(&self, role: UserRole) -> SyncResult<Vec<User>> {
        let query = Query::collection(collections::USERS).filter(Filter::equals("role", role.as_str()));
        let mut users: Vec<User> = decode_all(self.store.query(&query).await?);
        sort_by_label(&mut users);
        Ok(users)
    }

    /// Case-insensitive substring search over names and emails.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    #[instrument(skip(self))]
    pub async fn search_users(&self, text: &str) -> SyncResult<Vec<User>> {
        let needle = text.trim().to_lowercase();
        let all: Vec<User> = decode_all(self.store.query(&Query::collection(collections::USERS)).await?);
        let mut matches: Vec<User> = all.into_iter().filter(|u| u.matches_search(&needle)).collect();
        sort_by_label(&mut matches);
        debug!(results = matches.len(), "User search");
        Ok(matches)
    }

    /// Customers linked to an account manager through `relatedIds`.
    /// Ids without a profile are skipped.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown manager or a store error.
    pub async fn assigned_customers(&self, manager: &UserId) -> SyncResult<Vec<User>> {
        let manager = self.get_user(manager).await?;
        let lookups = manager.related_ids.iter().map(|id| self.find_user(id));
        let mut customers = Vec::with_capacity(manager.related_ids.len());
        for result in join_all(lookups).await {
            if let Some(user) = result? {
                customers.push(user);
            }
        }
        sort_by_label(&mut customers);
        Ok(customers)
    }

    /// A debounced search box over [`UserDirectory::search_users`].
    #[must_use]
    pub fn debounced_search(self: &Arc<Self>) -> DebouncedSearch<User> {
        let directory = Arc::clone(self);
        DebouncedSearch::new(self.search_debounce, move |text: String| {
            let directory = Arc::clone(&directory);
            async move { directory.search_users(&text).await }
        })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create an auth account and its customer profile.
    ///
    /// # Errors
    ///
    /// Returns auth errors (invalid email, weak password, existing account)
    /// or a store error.
    #[instrument(skip(self, password))]
    pub async fn register(&self, email: &str, password: &SecretString, display_name: &str) -> SyncResult<User> {
        let identity = self.auth.sign_up(email, password).await?;
        let user = User::new(identity.id, identity.email, display_name.trim());
        self.store
            .set_document(collections::USERS, user.id.as_str(), user.encode())
            .await?;
        info!(uid = %user.id, "User registered");
        Ok(user)
    }

    /// Change another user's role. Admins only.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `Validation` when changing one's own role,
    /// `NotFound`, or a store error.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn update_role(&self, actor: &Actor, target: &UserId, role: UserRole) -> SyncResult<()> {
        actor.require(Permission::ChangeRoles)?;
        if &actor.id == target {
            return Err(SyncError::validation("you cannot change your own role"));
        }
        self.update(target, FieldUpdates::new().set("role", role.as_str()))
            .await?;
        info!(%role, "Role updated");
        Ok(())
    }

    /// Update one's own profile.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when editing someone else's profile or blanking
    /// the name, `NotFound`, or a store error.
    #[instrument(skip(self, actor, update), fields(actor = %actor.id))]
    pub async fn update_profile(&self, actor: &Actor, target: &UserId, update: ProfileUpdate) -> SyncResult<()> {
        if &actor.id != target {
            return Err(SyncError::validation("you can only edit your own profile"));
        }
        let updates = update.into_updates()?;
        if updates.is_empty() {
            return Ok(());
        }
        self.update(target, updates).await?;
        self.names.invalidate(target).await;
        Ok(())
    }

    /// Add a device's push token to the user's profile.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a blank token, `NotFound`, or a store error.
    pub async fn register_push_token(&self, user: &UserId, token: &str) -> SyncResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SyncError::validation("push token is empty"));
        }
        let profile = self.get_user(user).await?;
        if profile.push_tokens.iter().any(|t| t == token) {
            return Ok(());
        }
        let mut tokens = profile.push_tokens;
        tokens.push(token.to_string());
        self.update(&profile.id, FieldUpdates::new().set("pushTokens", json!(tokens)))
            .await
    }

    /// Remove a push token, e.g. on sign-out or after the push platform
    /// reports it invalid.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or a store error.
    pub async fn remove_push_token(&self, user: &UserId, token: &str) -> SyncResult<()> {
        let profile = self.get_user(user).await?;
        if !profile.push_tokens.iter().any(|t| t == token) {
            return Ok(());
        }
        let tokens: Vec<&String> = profile.push_tokens.iter().filter(|t| *t != token).collect();
        self.update(&profile.id, FieldUpdates::new().set("pushTokens", json!(tokens)))
            .await
    }

    // =========================================================================
    // Display names
    // =========================================================================

    /// Resolve display names for `ids`.
    ///
    /// Lookups run concurrently. An id without a profile, or whose lookup
    /// failed, maps to itself.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first.
    pub async fn display_names(
        &self,
        ids: &[UserId],
        cancel: &CancellationToken,
    ) -> SyncResult<HashMap<UserId, String>> {
        let mut unique = ids.to_vec();
        unique.sort();
        unique.dedup();

        let lookups = join_all(unique.iter().map(|id| async move { (id.clone(), self.display_name(id).await) }));
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SyncError::Cancelled),
            names = lookups => Ok(names.into_iter().collect()),
        }
    }

    /// One display name, through the cache.
    pub async fn display_name(&self, id: &UserId) -> String {
        if let Some(name) = self.names.get(id).await {
            return name;
        }
        match self.find_user(id).await {
            Ok(Some(user)) => {
                let name = user.label().to_string();
                self.names.insert(id.clone(), name.clone()).await;
                name
            }
            Ok(None) => id.to_string(),
            Err(e) => {
                warn!(uid = %id, error = %e, "Display name lookup failed");
                id.to_string()
            }
        }
    }

    /// Push tokens for each of `ids`, skipping unknown users.
    pub(crate) async fn push_tokens(&self, ids: &[UserId]) -> Vec<(UserId, Vec<String>)> {
        let lookups = ids.iter().map(|id| async move { (id.clone(), self.find_user(id).await) });
        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(Some(user)) => Some((id, user.push_tokens)),
                Ok(None) => None,
                Err(e) => {
                    warn!(uid = %id, error = %e, "Push token lookup failed");
                    None
                }
            })
            .collect()
    }

    async fn update(&self, id: &UserId, updates: FieldUpdates) -> SyncResult<()> {
        self.store
            .update_fields(collections::USERS, id.as_str(), updates)
            .await
            .map_err(|e| SyncError::from_store(e, User::KIND, id.as_str()))
    }
}

fn sort_by_label(users: &mut [User]) {
    users.sort_by_cached_key(|u| (u.label().to_lowercase(), u.id.clone()));
}
