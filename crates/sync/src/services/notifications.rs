//! Push notifications.
//!
//! Sending a message writes one request document per recipient device to the
//! `notifications` collection. The relay consumes those documents, hands a
//! platform payload to a [`PushSender`], and deletes each request whether the
//! send worked or not. Delivery is at most once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use packline_core::UserId;

use super::users::UserDirectory;
use crate::error::SyncResult;
use crate::models::{Chat, ChatMessage};
use crate::store::{ChangeKind, ChangeStream, DocumentStore, Query, Snapshot, WriteBatch, collections, fields};

// =============================================================================
// Dispatcher
// =============================================================================

/// Writes push requests for new messages.
pub struct NotificationDispatcher {
    store: Arc<dyn DocumentStore>,
    directory: Arc<UserDirectory>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, directory: Arc<UserDirectory>) -> Self {
        Self { store, directory }
    }

    /// Queue one push request per device of every participant except the
    /// sender. Returns how many requests were written.
    ///
    /// # Errors
    ///
    /// Returns a store error if the batch could not be committed.
    #[instrument(skip(self, chat, message), fields(chat_id = %chat.id, message_id = %message.id))]
    pub async fn message_created(&self, chat: &Chat, message: &ChatMessage) -> SyncResult<usize> {
        let recipients: Vec<UserId> = chat
            .participants
            .iter()
            .filter(|p| **p != message.sender_id)
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Ok(0);
        }

        let title = self.directory.display_name(&message.sender_id).await;
        let body = message
            .text
            .clone()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| message.preview());

        let mut batch = WriteBatch::new();
        for (recipient, tokens) in self.directory.push_tokens(&recipients).await {
            debug!(uid = %recipient, devices = tokens.len(), "Queueing push");
            for token in tokens {
                let request = json!({
                    "token": token,
                    "notification": {"title": title, "body": body},
                    "data": {
                        "chatId": chat.id.as_str(),
                        "messageId": message.id.as_str(),
                        "senderId": message.sender_id.as_str(),
                    },
                    "createdAt": fields::timestamp_value(message.timestamp),
                });
                if let serde_json::Value::Object(doc) = request {
                    batch = batch.set(collections::NOTIFICATIONS, uuid::Uuid::new_v4().to_string(), doc);
                }
            }
        }

        let queued = batch.len();
        if queued > 0 {
            self.store.commit(batch).await?;
            info!(queued, "Push requests queued");
        }
        Ok(queued)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Platform payload: an APNs-style `aps` block plus string `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    pub token: String,
    pub aps: Aps,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aps {
    pub alert: Alert,
    pub sound: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub title: String,
    pub body: String,
}

impl PushPayload {
    /// Build a payload from a `notifications` request document.
    ///
    /// # Errors
    ///
    /// Returns `PushError::Malformed` when the token or alert is missing.
    pub fn from_request(snapshot: &Snapshot) -> Result<Self, PushError> {
        let doc = &snapshot.data;
        let token = fields::non_empty_string(doc, "token")
            .ok_or_else(|| PushError::Malformed("missing token".to_string()))?;
        let notification = fields::object(doc, "notification")
            .ok_or_else(|| PushError::Malformed("missing notification".to_string()))?;
        let data = fields::object(doc, "data")
            .map(|data| {
                data.iter()
                    .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            token,
            aps: Aps {
                alert: Alert {
                    title: fields::string_or_default(notification, "title"),
                    body: fields::string_or_default(notification, "body"),
                },
                sound: "default".to_string(),
            },
            data,
        })
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Push delivery failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    /// The platform no longer accepts this device token.
    #[error("invalid device token")]
    InvalidToken,

    #[error("push service unavailable: {0}")]
    Unavailable(String),

    /// The request document could not be turned into a payload.
    #[error("malformed push request: {0}")]
    Malformed(String),
}

/// Delivers payloads to a push platform.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, payload: &PushPayload) -> Result<(), PushError>;
}

/// In-process sender that records every payload.
#[derive(Debug, Default)]
pub struct RecordingPushSender {
    sent: Mutex<Vec<PushPayload>>,
    failures: AtomicUsize,
}

impl RecordingPushSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<PushPayload> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Fail the next `n` sends with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(&self, payload: &PushPayload) -> Result<(), PushError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PushError::Unavailable("injected failure".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| PushError::Unavailable("recorder poisoned".to_string()))?
            .push(payload.clone());
        Ok(())
    }
}

// =============================================================================
// Relay
// =============================================================================

/// What happened to one push request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Sent,
    Failed,
    Malformed,
}

/// Drains the `notifications` collection into a [`PushSender`].
pub struct PushRelay {
    store: Arc<dyn DocumentStore>,
    sender: Arc<dyn PushSender>,
}

impl PushRelay {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, sender: Arc<dyn PushSender>) -> Self {
        Self { store, sender }
    }

    /// Send one request and delete it.
    #[instrument(skip(self, snapshot), fields(request_id = %snapshot.id))]
    pub async fn process(&self, snapshot: &Snapshot) -> RelayOutcome {
        let outcome = match PushPayload::from_request(snapshot) {
            Ok(payload) => match self.sender.send(&payload).await {
                Ok(()) => RelayOutcome::Sent,
                Err(e) => {
                    warn!(error = %e, "Push failed");
                    RelayOutcome::Failed
                }
            },
            Err(e) => {
                warn!(error = %e, "Dropping push request");
                RelayOutcome::Malformed
            }
        };

        if let Err(e) = self
            .store
            .delete_document(collections::NOTIFICATIONS, &snapshot.id)
            .await
        {
            error!(error = %e, "Failed to delete push request");
        }
        outcome
    }

    /// Process every added request until the stream ends or `cancel` fires.
    /// Returns the number of requests processed.
    pub async fn run(&self, mut stream: ChangeStream, cancel: &CancellationToken) -> usize {
        let mut processed = 0;
        loop {
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(batch)) => batch,
                    Some(Err(e)) => {
                        warn!(error = %e, "Notification stream error");
                        continue;
                    }
                    None => break,
                },
            };
            for change in batch.changes.iter().filter(|c| c.kind == ChangeKind::Added) {
                self.process(&change.snapshot).await;
                processed += 1;
            }
        }
        debug!(processed, "Push relay stopped");
        processed
    }

    /// Subscribe to the `notifications` collection and run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns a store error if the subscription could not be opened.
    pub async fn subscribe_and_run(&self, cancel: CancellationToken) -> SyncResult<usize> {
        let stream = self
            .store
            .subscribe(Query::collection(collections::NOTIFICATIONS))
            .await?;
        Ok(self.run(stream, &cancel).await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::Utc;
    use packline_core::{ChatId, ChatKind, Email, UserRole};
    use serde_json::Value;

    use super::*;
    use crate::auth::MemoryAuth;
    use crate::config::NameCacheConfig;
    use crate::models::{DocumentModel, MessageContent, User};
    use crate::store::MemoryStore;

    async fn seed_user(store: &MemoryStore, id: &str, name: &str, tokens: &[&str]) {
        let mut user = User::new(
            UserId::new(id),
            Email::parse(&format!("{id}@shop.example")).unwrap(),
            name,
        )
        .with_role(UserRole::Customer);
        user.push_tokens = tokens.iter().map(|t| (*t).to_string()).collect();
        store.set_document(collections::USERS, id, user.encode()).await.unwrap();
    }

    fn dispatcher(store: &Arc<MemoryStore>) -> NotificationDispatcher {
        let directory = UserDirectory::new(store.clone(), Arc::new(MemoryAuth::new()), NameCacheConfig::default());
        NotificationDispatcher::new(store.clone(), Arc::new(directory))
    }

    fn chat(participants: &[&str]) -> Chat {
        Chat {
            id: ChatId::new("c-1"),
            participants: participants.iter().map(|p| UserId::new(*p)).collect(),
            last_message: None,
            kind: ChatKind::Customer,
            unread: BTreeMap::new(),
            title: None,
            created_at: Utc::now(),
        }
    }

    fn request(token: Value) -> Snapshot {
        let value = json!({
            "token": token,
            "notification": {"title": "Mia", "body": "Proof is ready"},
            "data": {"chatId": "c-1", "messageId": "m-1", "senderId": "am-1"},
        });
        Snapshot::new("n-1", value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_one_request_per_recipient_device() {
        let store = Arc::new(MemoryStore::new());
        seed_user(&store, "am-1", "Mia", &["tok-mia"]).await;
        seed_user(&store, "ann", "Ann", &["tok-a1", "tok-a2"]).await;
        seed_user(&store, "bob", "Bob", &[]).await;

        let message = ChatMessage::new(UserId::new("am-1"), MessageContent::Text("Proof is ready".into()), Utc::now());
        let queued = dispatcher(&store)
            .message_created(&chat(&["ann", "am-1", "bob", "ghost"]), &message)
            .await
            .unwrap();
        assert_eq!(queued, 2);

        let requests = store
            .query(&Query::collection(collections::NOTIFICATIONS))
            .await
            .unwrap();
        assert_eq!(requests.len(), 2);
        let payload = PushPayload::from_request(&requests[0]).unwrap();
        assert!(payload.token.starts_with("tok-a"));
        assert_eq!(payload.aps.alert.title, "Mia");
        assert_eq!(payload.aps.alert.body, "Proof is ready");
        assert_eq!(payload.data["senderId"], "am-1");
    }

    #[tokio::test]
    async fn test_media_message_uses_placeholder_body() {
        let store = Arc::new(MemoryStore::new());
        seed_user(&store, "ann", "Ann", &["tok-a"]).await;
        let message = ChatMessage::new(
            UserId::new("am-1"),
            MessageContent::Media {
                url: url::Url::parse("https://files.example/proof.png").unwrap(),
                kind: packline_core::MediaKind::Image,
            },
            Utc::now(),
        );
        dispatcher(&store)
            .message_created(&chat(&["ann", "am-1"]), &message)
            .await
            .unwrap();
        let requests = store
            .query(&Query::collection(collections::NOTIFICATIONS))
            .await
            .unwrap();
        let payload = PushPayload::from_request(&requests[0]).unwrap();
        assert_eq!(payload.aps.alert.body, "Sent an image");
        // Unknown sender falls back to the raw id.
        assert_eq!(payload.aps.alert.title, "am-1");
    }

    #[tokio::test]
    async fn test_relay_deletes_after_success_and_failure() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingPushSender::new());
        let relay = PushRelay::new(store.clone(), sender.clone());

        let snapshot = request(json!("tok-a"));
        store
            .set_document(collections::NOTIFICATIONS, "n-1", snapshot.data.clone())
            .await
            .unwrap();
        assert_eq!(relay.process(&snapshot).await, RelayOutcome::Sent);
        assert!(store.is_empty(collections::NOTIFICATIONS));
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(
            serde_json::to_value(&sender.sent()[0]).unwrap()["aps"]["alert"]["title"],
            "Mia"
        );

        store
            .set_document(collections::NOTIFICATIONS, "n-1", snapshot.data.clone())
            .await
            .unwrap();
        sender.fail_next(1);
        assert_eq!(relay.process(&snapshot).await, RelayOutcome::Failed);
        assert!(store.is_empty(collections::NOTIFICATIONS));
        assert_eq!(sender.sent().len(), 1);

        assert_eq!(relay.process(&request(json!(""))).await, RelayOutcome::Malformed);
    }

    #[tokio::test]
    async fn test_relay_runs_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingPushSender::new());
        let relay = Arc::new(PushRelay::new(store.clone(), sender.clone()));
        let cancel = CancellationToken::new();

        let task = {
            let relay = Arc::clone(&relay);
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.subscribe_and_run(cancel).await })
        };
        while store.listener_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store
            .set_document(collections::NOTIFICATIONS, "n-1", request(json!("tok-a")).data)
            .await
            .unwrap();
        while sender.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let processed = task.await.unwrap().unwrap();
        assert_eq!(processed, 1);
        assert_eq!(store.listener_count(), 0);
    }
}
