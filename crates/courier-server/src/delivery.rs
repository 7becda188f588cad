//! Delivery Coordinator: the send protocol shared by the live transport
//! and the REST fallback.
//!
//! A send validates its mode-specific fields, sanitizes textual content,
//! resolves the conversation, persists the message, bumps the receiver's
//! unread counter, and fans the stored message out to whoever is live.
//! Persistence always wins over fan-out: if no session is connected the
//! message is still durably stored and discovered by a later poll.
//!
//! Store work runs on the blocking pool with a connection checked out per
//! unit, so one session's persistence never stalls another session's
//! event processing.

use tracing::{debug, warn};

use courier_shared::envelope::MessageBody;
use courier_shared::protocol::{SendMessageRequest, ServerEvent};
use courier_shared::sanitize::sanitize_text;
use courier_shared::types::{ConversationId, UserId};
use courier_store::{Database, DatabasePool, Message, NewMessage, StoreError};

use crate::auth::ProfileDirectory;
use crate::error::ServerError;
use crate::rooms::{RoomId, RoomRegistry, SessionId};

pub struct DeliveryCoordinator {
    pool: DatabasePool,
    rooms: RoomRegistry,
    profiles: ProfileDirectory,
}

impl DeliveryCoordinator {
    pub fn new(pool: DatabasePool, rooms: RoomRegistry, profiles: ProfileDirectory) -> Self {
        Self {
            pool,
            rooms,
            profiles,
        }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Run a unit of store work on the blocking pool with its own
    /// checked-out connection. SQLite calls never run on the async
    /// executor, and concurrent units proceed on separate connections.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let db = pool.get()?;
            f(&db)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("storage task failed: {e}")))?
        .map_err(ServerError::from)
    }

    /// Execute a send on behalf of `sender` (taken from the authenticated
    /// session, never from the payload).
    ///
    /// `origin` is the live session the request arrived on, if any; it is
    /// excluded from conversation-room fan-out because it receives a
    /// dedicated `MessageSent` acknowledgement instead.
    pub async fn send(
        &self,
        sender: &UserId,
        req: SendMessageRequest,
        origin: Option<&SessionId>,
    ) -> Result<Message, ServerError> {
        // Step 1+2: mode validation and sanitisation, before any persistence.
        let body = validate_body(&req)?;
        if req.receiver_id.as_str().is_empty() {
            return Err(ServerError::Validation("receiverId is required".into()));
        }

        // Steps 3-5 are a unit: resolve conversation, append, bump counter.
        let sender_id = sender.clone();
        let receiver_id = req.receiver_id.clone();
        let kind = req.kind;
        let file = req.file.clone();
        let client_token = req.client_token.clone();

        let stored = self
            .with_store(move |db| {
                let conversation = db.find_or_create_conversation(&sender_id, &receiver_id)?;

                let stored = db.append_message(NewMessage {
                    conversation_id: conversation.id.clone(),
                    sender_id,
                    receiver_id,
                    kind,
                    body,
                    file,
                    client_token,
                })?;

                // The message is already durable; if the counter update fails
                // we retry the counter, never the insert (a duplicate message
                // is worse than a stale counter).
                if let Err(first) = db.update_last_message(&stored) {
                    warn!(
                        conversation = %stored.conversation_id,
                        error = %first,
                        "preview/counter update failed, retrying once"
                    );
                    db.update_last_message(&stored)?;
                }

                Ok(stored)
            })
            .await?;

        // Step 6: fan-out, fire-and-forget.
        let payload = stored.clone().into();
        let event = ServerEvent::NewMessage {
            message: payload,
            sender: self.profiles.get(sender),
        };

        let receiver_live = self.rooms.send_to_user(&stored.receiver_id, &event);
        self.rooms.broadcast(
            &RoomId::Conversation(stored.conversation_id.clone()),
            &event,
            origin,
        );

        if !receiver_live {
            // Step 7: no live session; the recipient's reconnection
            // controller will discover the message via polling.
            debug!(
                receiver = %stored.receiver_id,
                message = %stored.id,
                "receiver offline, stored for poll discovery"
            );
        }

        Ok(stored)
    }

    /// Mark everything the other participant sent in this conversation as
    /// read, reset the reader's unread counter, and notify the other
    /// participant's live sessions. Idempotent end to end.
    pub async fn mark_read(
        &self,
        reader: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<u32, ServerError> {
        let reader_id = reader.clone();
        let id = conversation_id.clone();
        let (other, newly_read) = self
            .with_store(move |db| {
                let conversation = db.get_conversation(&id)?;

                let other = conversation
                    .other_participant(&reader_id)
                    .ok_or_else(|| {
                        StoreError::Forbidden("not a participant of this conversation".into())
                    })?
                    .clone();

                let newly_read = db.mark_read(&reader_id, &other)?;
                db.mark_conversation_read(&id, &reader_id)?;
                Ok((other, newly_read))
            })
            .await?;

        if newly_read > 0 {
            let event = ServerEvent::MessagesRead {
                conversation_id: conversation_id.clone(),
                reader_id: reader.clone(),
                read_at: chrono::Utc::now(),
            };
            self.rooms.send_to_user(&other, &event);
            self.rooms
                .broadcast(&RoomId::Conversation(conversation_id.clone()), &event, None);
        }

        Ok(newly_read)
    }
}

/// Validate the mode-specific required fields and produce the message
/// body. Simplified mode requires plaintext content; encrypted mode
/// requires the full envelope. There is no silent fallback between modes.
pub fn validate_body(req: &SendMessageRequest) -> Result<MessageBody, ServerError> {
    if req.encrypted {
        let encrypted_content = req
            .encrypted_content
            .as_deref()
            .ok_or_else(|| missing("encryptedContent"))?;
        let encrypted_key = req
            .encrypted_key
            .as_deref()
            .ok_or_else(|| missing("encryptedKey"))?;
        let iv = req.iv.as_deref().ok_or_else(|| missing("iv"))?;

        MessageBody::encrypted(encrypted_content, encrypted_key, iv)
            .map_err(|e| ServerError::Validation(e.to_string()))
    } else {
        let content = req
            .content
            .as_deref()
            .ok_or_else(|| missing("content"))?;

        MessageBody::plain(sanitize_text(content))
            .map_err(|e| ServerError::Validation(e.to_string()))
    }
}

fn missing(field: &str) -> ServerError {
    ServerError::Validation(format!("{field} is required for this mode"))
}
