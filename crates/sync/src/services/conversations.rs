//! Conversation registry.
//!
//! Chats keep a per-participant unread flag. Each flag moves `false -> true`
//! when someone else sends a message and `true -> false` only when that
//! participant reads the chat. A message append and the chat summary update
//! are committed as one batch, so the summary always describes the newest
//! message in the log.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use packline_core::{ChatId, ChatKind, MediaKind, Permission, UserId};

use super::Actor;
use super::notifications::NotificationDispatcher;
use crate::blob::BlobStorage;
use crate::error::{SyncError, SyncResult};
use crate::models::chat::{CHAT_CREATED_TEXT, encode_unread};
use crate::models::{Chat, ChatMessage, DocumentModel, MessageContent, decode_all};
use crate::store::{
    ChangeBatch, ChangeKind, Cursor, DocumentStore, FieldPath, FieldUpdates, Filter, Query,
    WriteBatch, collections, fields,
};

/// Default number of messages per page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Chats, messages and unread state.
pub struct ConversationRegistry {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStorage>,
    notifications: Option<Arc<NotificationDispatcher>>,
    page_size: usize,
}

impl ConversationRegistry {
    /// Create a registry over the given collaborators.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStorage>) -> Self {
        Self {
            store,
            blobs,
            notifications: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Write push requests for every sent message.
    #[must_use]
    pub fn with_notifications(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.notifications = Some(dispatcher);
        self
    }

    /// Override the message page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    // =========================================================================
    // Chat lifecycle
    // =========================================================================

    /// Create a chat. The creator is added to the participants if missing,
    /// starts read, and everyone else starts unread.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` (team chats need `CreateTeamChat`),
    /// `Validation` if nobody besides the creator participates, or a store
    /// error.
    #[instrument(skip(self, creator, participants, kind), fields(creator = %creator.id, kind = %kind))]
    pub async fn create_chat(
        &self,
        creator: &Actor,
        participants: Vec<UserId>,
        title: Option<String>,
        kind: ChatKind,
    ) -> SyncResult<Chat> {
        creator.require(Permission::SendMessage)?;
        if kind == ChatKind::Team {
            creator.require(Permission::CreateTeamChat)?;
        }

        let mut seen = HashSet::new();
        let mut members: Vec<UserId> = participants
            .into_iter()
            .filter(|p| !p.as_str().trim().is_empty() && seen.insert(p.clone()))
            .collect();
        if !members.contains(&creator.id) {
            members.push(creator.id.clone());
        }
        if members.len() < 2 {
            return Err(SyncError::validation("a chat needs at least one other participant"));
        }

        let now = fields::now();
        let unread = members
            .iter()
            .map(|p| (p.clone(), p != &creator.id))
            .collect();
        let chat = Chat {
            id: ChatId::generate(),
            participants: members,
            last_message: Some(ChatMessage::new(
                creator.id.clone(),
                MessageContent::Text(CHAT_CREATED_TEXT.to_string()),
                now,
            )),
            kind,
            unread,
            title: title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            created_at: now,
        };

        self.store
            .set_document(collections::CHATS, chat.id.as_str(), chat.encode())
            .await?;
        info!(chat_id = %chat.id, participants = chat.participants.len(), "Chat created");
        Ok(chat)
    }

    /// Delete a chat document. Admins and account managers only. The
    /// message log is left to the store.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` before touching the store, or a store error.
    #[instrument(skip(self, actor, chat), fields(chat_id = %chat.id, actor = %actor.id))]
    pub async fn delete_chat(&self, actor: &Actor, chat: &Chat) -> SyncResult<()> {
        actor.require(Permission::DeleteChat)?;
        self.store
            .delete_document(collections::CHATS, chat.id.as_str())
            .await?;
        info!("Chat deleted");
        Ok(())
    }

    /// Fetch one chat.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Decode`, or a store error.
    pub async fn get_chat(&self, id: &ChatId) -> SyncResult<Chat> {
        let snapshot = self
            .store
            .get_document(collections::CHATS, id.as_str())
            .await?
            .ok_or_else(|| SyncError::not_found(Chat::KIND, id.as_str()))?;
        Chat::try_decode(&snapshot).map_err(|source| SyncError::Decode {
            kind: Chat::KIND,
            id: snapshot.id.clone(),
            source,
        })
    }

    /// Every chat `user` participates in, most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn chats_for(&self, user: &UserId) -> SyncResult<Vec<Chat>> {
        let query = Query::collection(collections::CHATS)
            .filter(Filter::array_contains("participants", user.as_str()));
        let mut chats: Vec<Chat> = decode_all(self.store.query(&query).await?);
        sort_by_activity(&mut chats);
        Ok(chats)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send a message.
    ///
    /// The message append, the `lastMessage` overwrite and the unread map
    /// (everyone but the sender unread) are one atomic commit. Push requests
    /// are written afterwards; failing to write them does not fail the send.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `Validation` for empty text or a sender
    /// outside the chat, `NotFound` if the chat was deleted, or a store error.
    #[instrument(skip(self, chat, sender, content), fields(chat_id = %chat.id, sender = %sender.id))]
    pub async fn send_message(
        &self,
        chat: &Chat,
        sender: &Actor,
        content: MessageContent,
    ) -> SyncResult<ChatMessage> {
        sender.require(Permission::SendMessage)?;
        if !chat.is_participant(&sender.id) {
            return Err(SyncError::validation("only participants can post in this chat"));
        }
        let content = match content {
            MessageContent::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err(SyncError::validation("message is empty"));
                }
                MessageContent::Text(trimmed.to_string())
            }
            media @ MessageContent::Media { .. } => media,
        };

        let message = ChatMessage::new(sender.id.clone(), content, fields::now());
        let batch = WriteBatch::new()
            .set(
                collections::messages(chat.id.as_str()),
                message.id.as_str(),
                message.encode(),
            )
            .update(
                collections::CHATS,
                chat.id.as_str(),
                FieldUpdates::new()
                    .set("lastMessage", Value::Object(message.encode()))
                    .set("unread", encode_unread(&chat.unread_after_message_from(&sender.id))),
            );
        self.store
            .commit(batch)
            .await
            .map_err(|e| SyncError::from_store(e, Chat::KIND, chat.id.as_str()))?;
        debug!(message_id = %message.id, "Message sent");

        if let Some(dispatcher) = &self.notifications {
            if let Err(e) = dispatcher.message_created(chat, &message).await {
                warn!(error = %e, message_id = %message.id, "Failed to queue push notifications");
            }
        }
        Ok(message)
    }

    /// Upload a media file and send it as a message.
    ///
    /// # Errors
    ///
    /// Returns everything [`ConversationRegistry::send_message`] does, plus
    /// `Validation` for an empty file and blob errors.
    #[instrument(skip(self, chat, sender, bytes), fields(chat_id = %chat.id, size = bytes.len()))]
    pub async fn send_media(
        &self,
        chat: &Chat,
        sender: &Actor,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> SyncResult<ChatMessage> {
        sender.require(Permission::SendMessage)?;
        if !chat.is_participant(&sender.id) {
            return Err(SyncError::validation("only participants can post in this chat"));
        }
        if bytes.is_empty() {
            return Err(SyncError::validation("cannot send an empty file"));
        }
        let kind = MediaKind::from_content_type(content_type);
        if kind == MediaKind::Text {
            return Err(SyncError::validation(format!("unsupported media type {content_type}")));
        }

        let path = format!("chats/{}/{}", chat.id, uuid::Uuid::new_v4());
        self.blobs.upload(&path, bytes, content_type).await?;
        let url = self.blobs.download_url(&path).await?;
        self.send_message(chat, sender, MessageContent::Media { url, kind })
            .await
    }

    // =========================================================================
    // Read state
    // =========================================================================

    /// Mark the chat read for `participant`. Only that one key changes.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `participant` is not in the chat, `NotFound`
    /// if the chat was deleted, or a store error.
    #[instrument(skip(self, chat), fields(chat_id = %chat.id))]
    pub async fn mark_read(&self, chat: &Chat, participant: &UserId) -> SyncResult<()> {
        if !chat.is_participant(participant) {
            return Err(SyncError::validation(format!(
                "{participant} is not a participant of this chat"
            )));
        }
        let path = FieldPath::new(["unread", participant.as_str()]);
        self.store
            .update_fields(collections::CHATS, chat.id.as_str(), FieldUpdates::new().set(path, false))
            .await
            .map_err(|e| SyncError::from_store(e, Chat::KIND, chat.id.as_str()))
    }

    /// Called when `viewer` opens a chat: marks it read if the latest message
    /// came from someone else. Returns whether a receipt was written.
    ///
    /// # Errors
    ///
    /// Returns what [`ConversationRegistry::mark_read`] returns.
    pub async fn open_chat(&self, chat: &Chat, viewer: &UserId) -> SyncResult<bool> {
        if !chat.needs_read_receipt(viewer) {
            return Ok(false);
        }
        self.mark_read(chat, viewer).await?;
        Ok(true)
    }

    /// `unread[participant]`, absent meaning no unread.
    #[must_use]
    pub fn has_unread(chat: &Chat, participant: &UserId) -> bool {
        chat.has_unread(participant)
    }

    /// A pager over the chat's messages.
    #[must_use]
    pub fn message_pager(&self, chat_id: &ChatId) -> MessagePager {
        MessagePager::new(Arc::clone(&self.store), chat_id.clone(), self.page_size)
    }
}

/// Order chats by last activity, newest first.
pub fn sort_by_activity(chats: &mut [Chat]) {
    chats.sort_by(|a, b| {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| a.id.cmp(&b.id))
    });
}

// =============================================================================
// Topics
// =============================================================================

/// All chats with one counterpart, folded into one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTopic {
    pub counterpart: UserId,
    /// Chats in the group, most recent first.
    pub chat_ids: Vec<ChatId>,
    /// Whether any chat in the group is unread for the viewer.
    pub has_unread: bool,
    pub last_activity: DateTime<Utc>,
}

/// Group `me`'s chats by counterpart (the first participant who is not
/// `me`). Chats without a counterpart, or without `me`, are skipped.
/// Topics are sorted by last activity, newest first.
#[must_use]
pub fn aggregate_topics(chats: &[Chat], me: &UserId) -> Vec<ChatTopic> {
    let mut groups: BTreeMap<&UserId, Vec<&Chat>> = BTreeMap::new();
    for chat in chats.iter().filter(|chat| chat.is_participant(me)) {
        if let Some(counterpart) = chat.counterpart(me) {
            groups.entry(counterpart).or_default().push(chat);
        }
    }

    let mut topics: Vec<ChatTopic> = groups
        .into_iter()
        .filter_map(|(counterpart, mut group)| {
            group.sort_by_key(|chat| std::cmp::Reverse(chat.last_activity()));
            let last_activity = group.first()?.last_activity();
            Some(ChatTopic {
                counterpart: counterpart.clone(),
                chat_ids: group.iter().map(|chat| chat.id.clone()).collect(),
                has_unread: group.iter().any(|chat| chat.has_unread(me)),
                last_activity,
            })
        })
        .collect();
    topics.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.counterpart.cmp(&b.counterpart))
    });
    topics
}

// =============================================================================
// Pagination
// =============================================================================

/// Newest-first paging over a chat's message log.
///
/// Messages are kept oldest first. `load_more` prepends the next older page
/// without touching what is already loaded; live messages are merged by id.
pub struct MessagePager {
    store: Arc<dyn DocumentStore>,
    chat_id: ChatId,
    page_size: usize,
    messages: Vec<ChatMessage>,
    cursor: Option<Cursor>,
    exhausted: bool,
}

impl MessagePager {
    /// A pager with nothing loaded yet.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, chat_id: ChatId, page_size: usize) -> Self {
        Self {
            store,
            chat_id,
            page_size: page_size.max(1),
            messages: Vec::new(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Loaded messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Whether older messages may remain.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// Load the next older page. Returns how many messages were added.
    ///
    /// # Errors
    ///
    /// Returns a store error; the pager is left unchanged.
    #[instrument(skip(self), fields(chat_id = %self.chat_id))]
    pub async fn load_more(&mut self) -> SyncResult<usize> {
        if self.exhausted {
            return Ok(0);
        }

        let mut query = Query::collection(collections::messages(self.chat_id.as_str()))
            .order_by_desc("timestamp")
            .limit(self.page_size);
        if let Some(cursor) = self.cursor.clone() {
            query = query.start_after(cursor);
        }
        let page = self.store.query(&query).await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(Cursor::after(last, "timestamp"));
        }

        let known: HashSet<&str> = self.messages.iter().map(|m| m.id.as_str()).collect();
        let mut older: Vec<ChatMessage> = decode_all::<ChatMessage, _>(page)
            .into_iter()
            .filter(|message| !known.contains(message.id.as_str()))
            .collect();
        older.reverse();
        let added = older.len();
        older.append(&mut self.messages);
        self.messages = older;

        debug!(added, exhausted = self.exhausted, "Loaded message page");
        Ok(added)
    }

    /// Insert or replace a message by id, keeping chronological order.
    pub fn merge(&mut self, message: ChatMessage) {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return;
        }
        let position = self
            .messages
            .partition_point(|m| (m.timestamp, m.id.as_str()) <= (message.timestamp, message.id.as_str()));
        self.messages.insert(position, message);
    }

    /// Apply a change batch from a subscription on the message log.
    pub fn apply(&mut self, batch: &ChangeBatch) {
        for change in &batch.changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if let Some(message) = ChatMessage::decode(&change.snapshot) {
                        self.merge(message);
                    }
                }
                ChangeKind::Removed => {
                    self.messages
                        .retain(|m| m.id.as_str() != change.snapshot.id);
                }
            }
        }
    }
}
