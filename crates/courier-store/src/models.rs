//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so records can be
//! handed to the transport layer without an extra mapping step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::envelope::MessageBody;
use courier_shared::protocol::{ConversationPayload, FileMeta, LastMessagePreview, MessagePayload};
use courier_shared::types::{ConversationId, MessageId, MessageKind, UserId};

// ---------------------------------------------------------------------------
// User key record
// ---------------------------------------------------------------------------

/// The active public key registered for a user.
///
/// At most one record exists per user; rotation supersedes in place rather
/// than appending, so two simultaneously-active keys cannot exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserKeyRecord {
    pub user_id: UserId,
    /// Opaque public key material.
    pub public_key: Vec<u8>,
    /// BLAKE3 content hash of the key, hex-encoded.
    pub fingerprint: String,
    pub last_rotated: DateTime<Utc>,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A two-participant conversation, keyed by the canonical sorted-pair id.
///
/// Participants are stored sorted (`lo < hi`); the per-participant unread
/// counters and soft-delete flags are addressed by that fixed position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_lo: UserId,
    pub participant_hi: UserId,
    pub last_message: Option<LastMessagePreview>,
    pub unread_lo: u32,
    pub unread_hi: u32,
    pub deleted_lo: bool,
    pub deleted_hi: bool,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn participants(&self) -> [&UserId; 2] {
        [&self.participant_lo, &self.participant_hi]
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.participant_lo == user || &self.participant_hi == user
    }

    /// The other participant, or `None` if `user` is not a participant.
    pub fn other_participant(&self, user: &UserId) -> Option<&UserId> {
        if user == &self.participant_lo {
            Some(&self.participant_hi)
        } else if user == &self.participant_hi {
            Some(&self.participant_lo)
        } else {
            None
        }
    }

    /// Unread count for one participant (0 for non-participants).
    pub fn unread_for(&self, user: &UserId) -> u32 {
        if user == &self.participant_lo {
            self.unread_lo
        } else if user == &self.participant_hi {
            self.unread_hi
        } else {
            0
        }
    }

    pub fn is_deleted_by(&self, user: &UserId) -> bool {
        (user == &self.participant_lo && self.deleted_lo)
            || (user == &self.participant_hi && self.deleted_hi)
    }

    /// Wire shape for a given viewer (the unread count is per-viewer).
    pub fn payload_for(&self, viewer: &UserId) -> ConversationPayload {
        ConversationPayload {
            id: self.id.clone(),
            participants: [self.participant_lo.clone(), self.participant_hi.clone()],
            last_message: self.last_message.clone(),
            unread_count: self.unread_for(viewer),
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Input to [`Database::append_message`]: everything the caller controls.
///
/// The content-presence invariant is carried by [`MessageBody`], which can
/// only be constructed with plaintext or a complete encrypted envelope.
///
/// [`Database::append_message`]: crate::Database::append_message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub body: MessageBody,
    pub file: Option<FileMeta>,
    pub client_token: Option<String>,
}

/// A stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub body: MessageBody,
    pub file: Option<FileMeta>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub client_token: Option<String>,
    pub is_deleted: bool,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessagePayload {
    fn from(m: Message) -> Self {
        MessagePayload {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            kind: m.kind,
            body: m.body,
            file: m.file,
            delivered: m.is_delivered,
            delivered_at: m.delivered_at,
            read: m.is_read,
            read_at: m.read_at,
            client_token: m.client_token,
            is_edited: m.is_edited,
            edited_at: m.edited_at,
            created_at: m.created_at,
        }
    }
}
