//! Authentication provider.
//!
//! Accounts and sessions belong to the hosted auth service. The sync layer
//! only asks who is signed in and reacts to sign-in changes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use packline_core::{Email, EmailError, UserId};

/// Minimum password length accepted at sign-up.
const MIN_PASSWORD_LENGTH: usize = 8;

/// The signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Auth provider UID.
    pub id: UserId,
    pub email: Email,
}

impl Identity {
    /// Whether `id` is either of this identity's keys (UID or legacy email).
    #[must_use]
    pub fn is(&self, id: &UserId) -> bool {
        &self.id == id || self.email.as_str() == id.as_str()
    }
}

/// Errors from the auth provider.
#[derive(Debug, Error)]
pub enum AuthError {
    /// An operation needed a signed-in identity.
    #[error("not signed in")]
    NotSignedIn,

    /// Invalid email format.
    #[error("invalid email: {0}")]
    InvalidEmail(#[from] EmailError),

    /// Wrong email or password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// An account with this email exists.
    #[error("account already exists")]
    AccountExists,

    /// Password too weak.
    #[error("password validation failed: {0}")]
    WeakPassword(String),

    /// The provider could not be reached.
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

/// The hosted authentication service.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The signed-in identity, if any.
    fn current_identity(&self) -> Option<Identity>;

    /// Sign in with email and password.
    async fn sign_in(&self, email: &str, password: &SecretString) -> Result<Identity, AuthError>;

    /// Create an account and sign it in.
    async fn sign_up(&self, email: &str, password: &SecretString) -> Result<Identity, AuthError>;

    /// End the session.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Receiver that observes every sign-in and sign-out.
    fn identity_changes(&self) -> watch::Receiver<Option<Identity>>;
}

/// The signed-in identity, or [`AuthError::NotSignedIn`].
///
/// # Errors
///
/// Returns `NotSignedIn` when nobody is signed in.
pub fn require_identity(auth: &dyn AuthProvider) -> Result<Identity, AuthError> {
    auth.current_identity().ok_or(AuthError::NotSignedIn)
}

struct Account {
    id: UserId,
    password: SecretString,
}

/// In-process auth provider.
pub struct MemoryAuth {
    accounts: Mutex<HashMap<Email, Account>>,
    current: watch::Sender<Option<Identity>>,
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuth {
    /// A provider with no accounts and nobody signed in.
    #[must_use]
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(HashMap::new()),
            current,
        }
    }

    /// Sign in `identity` directly, creating the account if needed.
    pub fn sign_in_as(&self, identity: Identity) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.entry(identity.email.clone()).or_insert_with(|| Account {
                id: identity.id.clone(),
                password: SecretString::from(String::new()),
            });
        }
        self.current.send_replace(Some(identity));
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Email, Account>>, AuthError> {
        self.accounts
            .lock()
            .map_err(|_| AuthError::Unavailable("account table poisoned".to_string()))
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    fn current_identity(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    async fn sign_in(&self, email: &str, password: &SecretString) -> Result<Identity, AuthError> {
        let email = Email::parse(email)?;
        let identity = {
            let accounts = self.lock()?;
            let account = accounts.get(&email).ok_or(AuthError::InvalidCredentials)?;
            if account.password.expose_secret() != password.expose_secret() {
                return Err(AuthError::InvalidCredentials);
            }
            Identity {
                id: account.id.clone(),
                email,
            }
        };
        info!(uid = %identity.id, "Signed in");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_up(&self, email: &str, password: &SecretString) -> Result<Identity, AuthError> {
        let email = Email::parse(email)?;
        validate_password(password)?;
        let identity = {
            let mut accounts = self.lock()?;
            if accounts.contains_key(&email) {
                return Err(AuthError::AccountExists);
            }
            let id = UserId::generate();
            accounts.insert(
                email.clone(),
                Account {
                    id: id.clone(),
                    password: SecretString::from(password.expose_secret().to_string()),
                },
            );
            Identity { id, email }
        };
        info!(uid = %identity.id, "Account created");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.current.send_replace(None);
        Ok(())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

fn validate_password(password: &SecretString) -> Result<(), AuthError> {
    if password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[tokio::test]
    async fn test_sign_up_then_sign_in() {
        let auth = MemoryAuth::new();
        let created = auth.sign_up("Ann@Shop.Example", &secret("correct horse")).await.unwrap();
        assert_eq!(auth.current_identity(), Some(created.clone()));

        auth.sign_out().await.unwrap();
        assert!(auth.current_identity().is_none());

        let signed_in = auth.sign_in("ann@shop.example", &secret("correct horse")).await.unwrap();
        assert_eq!(signed_in, created);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let auth = MemoryAuth::new();
        auth.sign_up("ann@shop.example", &secret("correct horse")).await.unwrap();
        let err = auth.sign_in("ann@shop.example", &secret("wrong horse")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_sign_up_rejects_weak_and_duplicate() {
        let auth = MemoryAuth::new();
        assert!(matches!(
            auth.sign_up("ann@shop.example", &secret("short")).await.unwrap_err(),
            AuthError::WeakPassword(_)
        ));
        auth.sign_up("ann@shop.example", &secret("long enough")).await.unwrap();
        assert!(matches!(
            auth.sign_up("ann@shop.example", &secret("long enough")).await.unwrap_err(),
            AuthError::AccountExists
        ));
    }

    #[tokio::test]
    async fn test_identity_changes_observed() {
        let auth = MemoryAuth::new();
        let mut changes = auth.identity_changes();
        auth.sign_up("ann@shop.example", &secret("long enough")).await.unwrap();
        changes.changed().await.unwrap();
        assert!(changes.borrow_and_update().is_some());
        auth.sign_out().await.unwrap();
        changes.changed().await.unwrap();
        assert!(changes.borrow().is_none());
    }

    #[test]
    fn test_identity_matches_legacy_key() {
        let identity = Identity {
            id: UserId::new("uid-1"),
            email: Email::parse("ann@shop.example").unwrap(),
        };
        assert!(identity.is(&UserId::new("uid-1")));
        assert!(identity.is(&UserId::new("ann@shop.example")));
        assert!(!identity.is(&UserId::new("uid-2")));
        assert!(require_identity(&MemoryAuth::new()).is_err());
    }
}
