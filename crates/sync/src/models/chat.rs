//! Chats and chat messages.
//!
//! A chat document carries a denormalized copy of its latest message and a
//! per-participant unread map. The messages themselves live in the chat's
//! `messages` sub-log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use url::Url;

use packline_core::{ChatId, ChatKind, MediaKind, MessageId, UserId};

use super::{DecodeError, DocumentModel};
use crate::store::{Document, Snapshot, fields};

/// Text of the synthetic message written when a chat is created.
pub const CHAT_CREATED_TEXT: &str = "Chat created";

/// What a message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Media { url: Url, kind: MediaKind },
}

/// One message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub media_url: Option<Url>,
    pub media_kind: Option<MediaKind>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// A new message with a fresh id.
    #[must_use]
    pub fn new(sender_id: UserId, content: MessageContent, timestamp: DateTime<Utc>) -> Self {
        let (text, media_url, media_kind) = match content {
            MessageContent::Text(text) => (Some(text), None, None),
            MessageContent::Media { url, kind } => (None, Some(url), Some(kind)),
        };
        Self {
            id: MessageId::generate(),
            sender_id,
            text,
            media_url,
            media_kind,
            timestamp,
        }
    }

    /// Exactly one of: text, or media URL plus media type.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        let has_media = self.media_url.is_some() && self.media_kind.is_some();
        has_text != has_media
    }

    /// The content, if the message is well formed.
    #[must_use]
    pub fn content(&self) -> Option<MessageContent> {
        if !self.is_well_formed() {
            return None;
        }
        match (&self.text, &self.media_url, self.media_kind) {
            (Some(text), _, _) if !text.trim().is_empty() => Some(MessageContent::Text(text.clone())),
            (_, Some(url), Some(kind)) => Some(MessageContent::Media {
                url: url.clone(),
                kind,
            }),
            _ => None,
        }
    }

    /// One-line summary for chat lists and push bodies.
    #[must_use]
    pub fn preview(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.to_string();
        }
        match self.media_kind {
            Some(MediaKind::Image) => "Sent an image".to_string(),
            Some(MediaKind::Video) => "Sent a video".to_string(),
            Some(MediaKind::Pdf) => "Sent a PDF".to_string(),
            Some(MediaKind::Text) | None => "Sent a message".to_string(),
        }
    }

    fn from_fields(id: &str, doc: &Document) -> Result<Self, DecodeError> {
        let sender_id = fields::non_empty_string(doc, "senderId").ok_or(DecodeError::MissingField("senderId"))?;
        Ok(Self {
            id: MessageId::new(id),
            sender_id: UserId::new(sender_id),
            text: fields::string(doc, "text"),
            media_url: fields::string(doc, "mediaUrl").and_then(|raw| Url::parse(&raw).ok()),
            media_kind: fields::parsed(doc, "mediaType"),
            timestamp: fields::timestamp(doc, "timestamp").unwrap_or_else(fields::now),
        })
    }
}

impl DocumentModel for ChatMessage {
    const KIND: &'static str = "message";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }

    fn try_decode(snapshot: &Snapshot) -> Result<Self, DecodeError> {
        Self::from_fields(&snapshot.id, &snapshot.data)
    }

    fn encode(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("id".into(), json!(self.id.as_str()));
        doc.insert("senderId".into(), json!(self.sender_id.as_str()));
        doc.insert("text".into(), self.text.as_ref().map_or(Value::Null, |t| json!(t)));
        doc.insert(
            "mediaUrl".into(),
            self.media_url.as_ref().map_or(Value::Null, |url| json!(url.as_str())),
        );
        doc.insert(
            "mediaType".into(),
            self.media_kind.map_or(Value::Null, |kind| json!(kind.as_str())),
        );
        doc.insert("timestamp".into(), fields::timestamp_value(self.timestamp));
        doc
    }
}

/// A chat summary (`chats/{id}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    /// Participant identifiers in stored order.
    pub participants: Vec<UserId>,
    /// Copy of the latest message.
    pub last_message: Option<ChatMessage>,
    pub kind: ChatKind,
    /// Participant to has-unread. Missing keys mean no unread.
    pub unread: BTreeMap<UserId, bool>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// `unread[participant]`, defaulting to `false`.
    #[must_use]
    pub fn has_unread(&self, participant: &UserId) -> bool {
        self.unread.get(participant).copied().unwrap_or(false)
    }

    /// Whether `user` is a participant.
    #[must_use]
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// The first participant that is not `me`.
    #[must_use]
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        self.participants.iter().find(|p| *p != me)
    }

    /// Time of the latest message, or creation time for an empty chat.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map_or(self.created_at, |message| message.timestamp)
    }

    /// Drop unread keys that no longer belong to a participant.
    ///
    /// Returns `true` if anything was removed.
    pub fn prune_stale_unread(&mut self) -> bool {
        let before = self.unread.len();
        let participants = &self.participants;
        self.unread.retain(|key, _| participants.contains(key));
        self.unread.len() != before
    }

    /// Unread map after a message from `sender`: everyone else unread, the
    /// sender read. Keys are exactly the current participants.
    #[must_use]
    pub fn unread_after_message_from(&self, sender: &UserId) -> BTreeMap<UserId, bool> {
        self.participants
            .iter()
            .map(|p| (p.clone(), p != sender))
            .collect()
    }

    /// Whether the latest message should mark the chat read when `viewer`
    /// opens it.
    #[must_use]
    pub fn needs_read_receipt(&self, viewer: &UserId) -> bool {
        let authored_elsewhere = self
            .last_message
            .as_ref()
            .is_some_and(|message| &message.sender_id != viewer);
        authored_elsewhere && self.has_unread(viewer)
    }
}

/// The stored form of an unread map.
#[must_use]
pub fn encode_unread(unread: &BTreeMap<UserId, bool>) -> Value {
    Value::Object(
        unread
            .iter()
            .map(|(key, flag)| (key.to_string(), Value::Bool(*flag)))
            .collect(),
    )
}

impl DocumentModel for Chat {
    const KIND: &'static str = "chat";

    fn document_id(&self) -> &str {
        self.id.as_str()
    }

    fn try_decode(snapshot: &Snapshot) -> Result<Self, DecodeError> {
        let doc = &snapshot.data;
        let participants = fields::string_list(doc, "participants")
            .ok_or(DecodeError::MissingField("participants"))?
            .into_iter()
            .map(UserId::new)
            .collect();

        let last_message = fields::object(doc, "lastMessage").and_then(|raw| {
            let id = fields::string(raw, "id").unwrap_or_default();
            ChatMessage::from_fields(&id, raw).ok()
        });

        let unread = fields::object(doc, "unread")
            .map(|raw| {
                raw.iter()
                    .filter_map(|(key, flag)| flag.as_bool().map(|flag| (UserId::new(key.as_str()), flag)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: ChatId::new(snapshot.id.clone()),
            participants,
            last_message,
            kind: fields::parsed(doc, "type").unwrap_or_default(),
            unread,
            title: fields::non_empty_string(doc, "title"),
            created_at: fields::timestamp(doc, "createdAt").unwrap_or_else(fields::now),
        })
    }

    fn encode(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("id".into(), json!(self.id.as_str()));
        doc.insert(
            "participants".into(),
            json!(self.participants.iter().map(UserId::as_str).collect::<Vec<_>>()),
        );
        doc.insert(
            "lastMessage".into(),
            self.last_message
                .as_ref()
                .map_or(Value::Null, |message| Value::Object(message.encode())),
        );
        doc.insert("type".into(), json!(self.kind.as_str()));
        doc.insert("unread".into(), encode_unread(&self.unread));
        doc.insert("title".into(), self.title.as_ref().map_or(Value::Null, |t| json!(t)));
        doc.insert("createdAt".into(), fields::timestamp_value(self.created_at));
        doc
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).single().unwrap()
    }

    fn sample_chat() -> Chat {
        let me = UserId::new("me");
        let other = UserId::new("buyer@shop.example");
        Chat {
            id: ChatId::new("c-1"),
            participants: vec![me.clone(), other.clone()],
            last_message: Some(ChatMessage::new(
                other.clone(),
                MessageContent::Text("hello".into()),
                at(2_000),
            )),
            kind: ChatKind::Customer,
            unread: BTreeMap::from([(me, true), (other, false)]),
            title: Some("Artwork".into()),
            created_at: at(1_000),
        }
    }

    #[test]
    fn test_roundtrip_keeps_dotted_keys() {
        let chat = sample_chat();
        let decoded = Chat::try_decode(&Snapshot::new("c-1", chat.encode())).unwrap();
        assert_eq!(decoded, chat);
        assert!(!decoded.has_unread(&UserId::new("buyer@shop.example")));
    }

    #[test]
    fn test_decode_defaults() {
        let chat = Chat::try_decode(&Snapshot::new(
            "c-2",
            json!({"participants": ["a"], "unread": {"a": "yes"}, "type": "group"})
                .as_object()
                .cloned()
                .unwrap(),
        ))
        .unwrap();
        assert_eq!(chat.kind, ChatKind::Customer);
        assert!(chat.unread.is_empty());
        assert!(chat.last_message.is_none());
        assert!(chat.title.is_none());
    }

    #[test]
    fn test_has_unread_defaults_false() {
        let chat = sample_chat();
        assert!(chat.has_unread(&UserId::new("me")));
        assert!(!chat.has_unread(&UserId::new("stranger")));
    }

    #[test]
    fn test_counterpart() {
        let chat = sample_chat();
        assert_eq!(chat.counterpart(&UserId::new("me")).unwrap().as_str(), "buyer@shop.example");
        let solo = Chat {
            participants: vec![UserId::new("me")],
            ..chat
        };
        assert!(solo.counterpart(&UserId::new("me")).is_none());
    }

    #[test]
    fn test_prune_stale_unread() {
        let mut chat = sample_chat();
        chat.unread.insert(UserId::new("former"), true);
        assert!(chat.prune_stale_unread());
        assert_eq!(chat.unread.len(), 2);
        assert!(!chat.prune_stale_unread());
    }

    #[test]
    fn test_unread_after_message() {
        let chat = sample_chat();
        let unread = chat.unread_after_message_from(&UserId::new("me"));
        assert_eq!(unread.get(&UserId::new("me")), Some(&false));
        assert_eq!(unread.get(&UserId::new("buyer@shop.example")), Some(&true));
    }

    #[test]
    fn test_needs_read_receipt() {
        let chat = sample_chat();
        assert!(chat.needs_read_receipt(&UserId::new("me")));
        assert!(!chat.needs_read_receipt(&UserId::new("buyer@shop.example")));
    }

    #[test]
    fn test_message_well_formed() {
        let text = ChatMessage::new(UserId::new("a"), MessageContent::Text("hi".into()), at(0));
        assert!(text.is_well_formed());
        assert_eq!(text.preview(), "hi");

        let media = ChatMessage::new(
            UserId::new("a"),
            MessageContent::Media {
                url: Url::parse("https://files.example/x.png").unwrap(),
                kind: MediaKind::Image,
            },
            at(0),
        );
        assert!(media.is_well_formed());
        assert_eq!(media.preview(), "Sent an image");

        let mut both = text;
        both.media_url = media.media_url.clone();
        both.media_kind = media.media_kind;
        assert!(!both.is_well_formed());
        assert!(both.content().is_none());
    }

    #[test]
    fn test_message_requires_sender() {
        let err = ChatMessage::try_decode(&Snapshot::new(
            "m-1",
            json!({"text": "hi"}).as_object().cloned().unwrap(),
        ))
        .unwrap_err();
        assert_eq!(err, DecodeError::MissingField("senderId"));
    }
}
