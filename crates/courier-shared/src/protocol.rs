//! Live-transport protocol: every event exchanged over the persistent
//! connection, plus the JSON payload shapes shared with the REST fallback.
//!
//! Events are JSON objects tagged by a `type` field so the two sides can
//! dispatch without peeking into payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::MessageBody;
use crate::types::{ConversationId, MessageId, MessageKind, SenderProfile, UserId};

// ---------------------------------------------------------------------------
// Payload shapes (shared by live push and REST fallback)
// ---------------------------------------------------------------------------

/// File attachment metadata carried by image/file messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub storage_path: String,
    pub mime_type: String,
}

/// A stored message as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Client-generated idempotency token; duplicate deliveries carrying
    /// the same token are reconciled at the presentation layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    pub is_edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Last-message preview denormalized onto a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePreview {
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

/// A conversation as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: ConversationId,
    pub participants: [UserId; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePreview>,
    /// Unread count for the requesting participant.
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
}

/// A send request, from either the live transport or the REST fallback.
///
/// Mode-specific content fields are optional *here* so that the Delivery
/// Coordinator can reject malformed combinations explicitly instead of
/// the decoder silently dropping them; there is no silent mode fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    /// True selects encrypted mode; false selects simplified (plaintext).
    #[serde(default)]
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    /// Client-generated idempotency token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

impl SendMessageRequest {
    /// Simplified-mode request with just a receiver and plaintext content.
    pub fn plain(receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            encrypted: false,
            content: Some(content.into()),
            encrypted_content: None,
            encrypted_key: None,
            iv: None,
            kind: MessageKind::Text,
            file: None,
            client_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> server events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a conversation room. In full-auth mode this also flushes read
    /// receipts for the other participant's pending messages.
    JoinConversation { conversation_id: ConversationId },
    /// Send a message through the Delivery Coordinator.
    SendMessage(SendMessageRequest),
    /// Fire-and-forget typing indicator scoped to a conversation room.
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    /// Fire-and-forget presence announcement.
    SetPresence { online: bool },
    /// Mark the conversation read for the caller. `sender_id` is an
    /// optional hint; the conversation's other participant is
    /// authoritative.
    MarkRead {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
    },
    /// Liveness heartbeat; resets the server-side inactivity timer.
    Heartbeat,
    /// Liveness probe distinct from heartbeat, answered with `Pong`
    /// carrying the same nonce (callback-style acknowledgement).
    Ping { nonce: u64 },
}

// ---------------------------------------------------------------------------
// Server -> client events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message addressed to the receiving user.
    NewMessage {
        message: MessagePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<SenderProfile>,
    },
    /// Send acknowledgement to the sender, correlated by the payload's
    /// `client_token`.
    MessageSent { message: MessagePayload },
    /// The other participant read the caller's messages.
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    UserPresence {
        user_id: UserId,
        online: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    HeartbeatAck,
    Pong { nonce: u64 },
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_tagging() {
        let ev = ClientEvent::Heartbeat;
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "heartbeat");

        let ev = ClientEvent::Ping { nonce: 7 };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["nonce"], 7);
    }

    #[test]
    fn send_request_accepts_minimal_plain_shape() {
        // What a thin REST caller would post in simplified mode.
        let req: SendMessageRequest = serde_json::from_str(
            r#"{"receiverId":"u2","content":"hello"}"#,
        )
        .unwrap();
        assert!(!req.encrypted);
        assert_eq!(req.kind, MessageKind::Text);
        assert_eq!(req.content.as_deref(), Some("hello"));
        assert!(req.encrypted_key.is_none());
    }

    #[test]
    fn message_payload_flattens_body() {
        let payload = MessagePayload {
            id: MessageId::new(),
            conversation_id: ConversationId("a_b".into()),
            sender_id: UserId::from("a"),
            receiver_id: UserId::from("b"),
            kind: MessageKind::Text,
            body: MessageBody::plain("salut").unwrap(),
            file: None,
            delivered: false,
            delivered_at: None,
            read: false,
            read_at: None,
            client_token: Some("tok-1".into()),
            is_edited: false,
            edited_at: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["mode"], "plain");
        assert_eq!(json["content"], "salut");
        assert_eq!(json["clientToken"], "tok-1");

        let back: MessagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
