//! Message Store: the append-only log of messages per conversation.
//!
//! Messages are never physically removed on user-initiated delete; they
//! are flagged and filtered out of reads. Delivery/read marking is a bulk
//! idempotent update so the live path and the REST fallback can both fire
//! without double-counting anything.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use courier_shared::envelope::MessageBody;
use courier_shared::protocol::FileMeta;
use courier_shared::types::{ConversationId, MessageId, MessageKind, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage};

impl Database {
    /// Append a message to the log, assigning its id and creation
    /// timestamp. Returns the stored record.
    ///
    /// The content-presence invariant is enforced before persistence by
    /// construction: `NewMessage.body` is a [`MessageBody`], which cannot
    /// exist without plaintext or a complete envelope. The schema carries
    /// a matching CHECK as a backstop.
    pub fn append_message(&self, new: NewMessage) -> Result<Message> {
        let message = Message {
            id: MessageId::new(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            kind: new.kind,
            body: new.body,
            file: new.file,
            is_delivered: false,
            delivered_at: None,
            is_read: false,
            read_at: None,
            client_token: new.client_token,
            is_deleted: false,
            is_edited: false,
            edited_at: None,
            created_at: Utc::now(),
        };

        let (content, encrypted_content, encrypted_key, iv) = body_columns(&message.body);

        self.conn().execute(
            "INSERT INTO messages (
                 id, conversation_id, sender_id, receiver_id, kind,
                 content, encrypted_content, encrypted_key, iv,
                 file_name, file_size, storage_path, mime_type,
                 client_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.kind.as_str(),
                content,
                encrypted_content,
                encrypted_key,
                iv,
                message.file.as_ref().map(|f| f.file_name.as_str()),
                message.file.as_ref().map(|f| f.file_size as i64),
                message.file.as_ref().map(|f| f.storage_path.as_str()),
                message.file.as_ref().map(|f| f.mime_type.as_str()),
                message.client_token,
                message.created_at.to_rfc3339(),
            ],
        )?;

        Ok(message)
    }

    /// Fetch one message by id, deleted or not.
    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Non-deleted messages exchanged between the pair in either
    /// direction, newest first, paginated.
    pub fn list_messages_between(
        &self,
        user_a: &UserId,
        user_b: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE is_deleted = 0
               AND ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4"
        ))?;

        let rows = stmt.query_map(
            params![user_a.as_str(), user_b.as_str(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Stamp every not-yet-delivered message from `sender` to `recipient`
    /// as delivered. Idempotent: with nothing pending this is a no-op.
    /// Returns the number of messages newly marked.
    pub fn mark_delivered(&self, recipient: &UserId, sender: &UserId) -> Result<u32> {
        let updated = self.conn().execute(
            "UPDATE messages SET is_delivered = 1, delivered_at = ?3
             WHERE receiver_id = ?1 AND sender_id = ?2 AND is_delivered = 0",
            params![
                recipient.as_str(),
                sender.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(updated as u32)
    }

    /// Stamp every unread message from `sender` to `recipient` as read
    /// (and implicitly delivered). Idempotent.
    pub fn mark_read(&self, recipient: &UserId, sender: &UserId) -> Result<u32> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn().execute(
            "UPDATE messages SET
                 is_read = 1, read_at = ?3,
                 is_delivered = 1,
                 delivered_at = COALESCE(delivered_at, ?3)
             WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
            params![recipient.as_str(), sender.as_str(), now],
        )?;
        Ok(updated as u32)
    }

    /// Replace a message's content. Only the original sender may edit;
    /// file/image messages and deleted messages are not editable. The
    /// creation timestamp is preserved so ordering is unaffected.
    pub fn edit_message(
        &self,
        id: &MessageId,
        requester: &UserId,
        new_body: MessageBody,
    ) -> Result<Message> {
        let existing = self.get_message(id)?;

        if &existing.sender_id != requester {
            return Err(StoreError::Forbidden(
                "only the sender may edit a message".into(),
            ));
        }
        if existing.kind.is_attachment() {
            return Err(StoreError::Forbidden(
                "file and image messages cannot be edited".into(),
            ));
        }
        if existing.is_deleted {
            return Err(StoreError::Forbidden(
                "deleted messages cannot be edited".into(),
            ));
        }

        let edited_at = Utc::now();
        let (content, encrypted_content, encrypted_key, iv) = body_columns(&new_body);

        self.conn().execute(
            "UPDATE messages SET
                 content = ?2, encrypted_content = ?3, encrypted_key = ?4, iv = ?5,
                 is_edited = 1, edited_at = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                content,
                encrypted_content,
                encrypted_key,
                iv,
                edited_at.to_rfc3339(),
            ],
        )?;

        self.get_message(id)
    }

    /// Flag a message deleted. The requester must be the sender or the
    /// receiver; the row is never physically removed.
    pub fn soft_delete_message(&self, id: &MessageId, requester: &UserId) -> Result<()> {
        let existing = self.get_message(id)?;

        if &existing.sender_id != requester && &existing.receiver_id != requester {
            return Err(StoreError::Forbidden(
                "only a participant may delete a message".into(),
            ));
        }

        self.conn().execute(
            "UPDATE messages SET is_deleted = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, kind, \
     content, encrypted_content, encrypted_key, iv, \
     file_name, file_size, storage_path, mime_type, \
     is_delivered, delivered_at, is_read, read_at, \
     client_token, is_deleted, is_edited, edited_at, created_at";

fn body_columns(
    body: &MessageBody,
) -> (
    Option<&str>,
    Option<&str>,
    Option<&str>,
    Option<&str>,
) {
    match body {
        MessageBody::Plain { content } => (Some(content.as_str()), None, None, None),
        MessageBody::Encrypted {
            encrypted_content,
            encrypted_key,
            iv,
        } => (
            None,
            Some(encrypted_content.as_str()),
            Some(encrypted_key.as_str()),
            Some(iv.as_str()),
        ),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let receiver_id: String = row.get(3)?;
    let kind_str: String = row.get(4)?;
    let content: Option<String> = row.get(5)?;
    let encrypted_content: Option<String> = row.get(6)?;
    let encrypted_key: Option<String> = row.get(7)?;
    let iv: Option<String> = row.get(8)?;
    let file_name: Option<String> = row.get(9)?;
    let file_size: Option<i64> = row.get(10)?;
    let storage_path: Option<String> = row.get(11)?;
    let mime_type: Option<String> = row.get(12)?;
    let is_delivered: bool = row.get(13)?;
    let delivered_at: Option<String> = row.get(14)?;
    let is_read: bool = row.get(15)?;
    let read_at: Option<String> = row.get(16)?;
    let client_token: Option<String> = row.get(17)?;
    let is_deleted: bool = row.get(18)?;
    let is_edited: bool = row.get(19)?;
    let edited_at: Option<String> = row.get(20)?;
    let created_str: String = row.get(21)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    // Rebuild the tagged body from whichever column set is present.
    let body = match (content, encrypted_content, encrypted_key, iv) {
        (Some(text), _, _, _) => MessageBody::Plain { content: text },
        (None, Some(ct), Some(key), Some(iv)) => MessageBody::Encrypted {
            encrypted_content: ct,
            encrypted_key: key,
            iv,
        },
        _ => {
            // Unreachable given the schema CHECK; map to a decode error
            // rather than panicking.
            return Err(rusqlite::Error::IntegralValueOutOfRange(5, 0));
        }
    };

    let file = match (file_name, file_size, storage_path, mime_type) {
        (Some(file_name), Some(file_size), Some(storage_path), Some(mime_type)) => Some(FileMeta {
            file_name,
            file_size: file_size as u64,
            storage_path,
            mime_type,
        }),
        _ => None,
    };

    let kind = MessageKind::from_str(&kind_str).unwrap_or(MessageKind::Text);

    let created_at = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(21, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId::new(sender_id),
        receiver_id: UserId::new(receiver_id),
        kind,
        body,
        file,
        is_delivered,
        delivered_at: parse_opt_ts(delivered_at, 14)?,
        is_read,
        read_at: parse_opt_ts(read_at, 16)?,
        client_token,
        is_deleted,
        is_edited,
        edited_at: parse_opt_ts(edited_at, 20)?,
        created_at,
    })
}

fn parse_opt_ts(s: Option<String>, col: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    col,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("msg.db")).unwrap();
        (dir, db)
    }

    fn setup_conversation(db: &Database) -> ConversationId {
        db.find_or_create_conversation(&UserId::from("u1"), &UserId::from("u2"))
            .unwrap()
            .id
    }

    fn plain_message(conv: &ConversationId, sender: &str, receiver: &str, text: &str) -> NewMessage {
        NewMessage {
            conversation_id: conv.clone(),
            sender_id: UserId::from(sender),
            receiver_id: UserId::from(receiver),
            kind: MessageKind::Text,
            body: MessageBody::plain(text).unwrap(),
            file: None,
            client_token: None,
        }
    }

    #[test]
    fn append_and_fetch_round_trip() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);

        let stored = db
            .append_message(plain_message(&conv, "u1", "u2", "hello"))
            .unwrap();
        let fetched = db.get_message(&stored.id).unwrap();

        assert_eq!(fetched, stored);
        assert!(!fetched.is_delivered);
        assert!(!fetched.is_read);
    }

    #[test]
    fn encrypted_body_round_trips_through_columns() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);

        let body = MessageBody::encrypted("Y2lwaGVy", "a2V5", "aXY=").unwrap();
        let stored = db
            .append_message(NewMessage {
                conversation_id: conv,
                sender_id: UserId::from("u1"),
                receiver_id: UserId::from("u2"),
                kind: MessageKind::Text,
                body: body.clone(),
                file: None,
                client_token: Some("tok-9".into()),
            })
            .unwrap();

        let fetched = db.get_message(&stored.id).unwrap();
        assert_eq!(fetched.body, body);
        assert_eq!(fetched.client_token.as_deref(), Some("tok-9"));
    }

    #[test]
    fn content_presence_check_enforced_by_schema() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);

        // Bypass the typed API; the schema CHECK must still reject a row
        // with neither content form.
        let result = db.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, kind, created_at)
             VALUES ('m1', ?1, 'u1', 'u2', 'text', ?2)",
            params![conv.as_str(), Utc::now().to_rfc3339()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn list_between_sees_both_directions_newest_first() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        db.append_message(plain_message(&conv, "u1", "u2", "first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.append_message(plain_message(&conv, "u2", "u1", "second")).unwrap();

        let messages = db.list_messages_between(&a, &b, 50, 0).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, MessageBody::plain("second").unwrap());
        // Argument order must not matter.
        let flipped = db.list_messages_between(&b, &a, 50, 0).unwrap();
        assert_eq!(flipped, messages);
    }

    #[test]
    fn pagination_applies_limit_and_offset() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        for i in 0..5 {
            db.append_message(plain_message(&conv, "u1", "u2", &format!("m{i}")))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let page = db.list_messages_between(&a, &b, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].body, MessageBody::plain("m2").unwrap());
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        db.append_message(plain_message(&conv, "u1", "u2", "x")).unwrap();
        db.append_message(plain_message(&conv, "u1", "u2", "y")).unwrap();

        assert_eq!(db.mark_read(&b, &a).unwrap(), 2);
        // Second invocation has nothing pending: a no-op, not an error.
        assert_eq!(db.mark_read(&b, &a).unwrap(), 0);

        let messages = db.list_messages_between(&a, &b, 50, 0).unwrap();
        assert!(messages.iter().all(|m| m.is_read && m.is_delivered));
    }

    #[test]
    fn mark_delivered_does_not_mark_read() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        db.append_message(plain_message(&conv, "u1", "u2", "x")).unwrap();
        assert_eq!(db.mark_delivered(&b, &a).unwrap(), 1);
        assert_eq!(db.mark_delivered(&b, &a).unwrap(), 0);

        let messages = db.list_messages_between(&a, &b, 50, 0).unwrap();
        assert!(messages[0].is_delivered);
        assert!(!messages[0].is_read);
    }

    #[test]
    fn only_sender_may_edit() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);

        let stored = db
            .append_message(plain_message(&conv, "u1", "u2", "original"))
            .unwrap();

        let err = db
            .edit_message(
                &stored.id,
                &UserId::from("u2"),
                MessageBody::plain("hijacked").unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        let edited = db
            .edit_message(
                &stored.id,
                &UserId::from("u1"),
                MessageBody::plain("fixed").unwrap(),
            )
            .unwrap();
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.body, MessageBody::plain("fixed").unwrap());
        // Ordering key preserved.
        assert_eq!(edited.created_at, stored.created_at);
    }

    #[test]
    fn attachments_and_deleted_messages_are_not_editable() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);

        let file_msg = db
            .append_message(NewMessage {
                conversation_id: conv.clone(),
                sender_id: UserId::from("u1"),
                receiver_id: UserId::from("u2"),
                kind: MessageKind::File,
                body: MessageBody::plain("report.pdf").unwrap(),
                file: Some(FileMeta {
                    file_name: "report.pdf".into(),
                    file_size: 1024,
                    storage_path: "/files/report.pdf".into(),
                    mime_type: "application/pdf".into(),
                }),
                client_token: None,
            })
            .unwrap();

        let err = db
            .edit_message(
                &file_msg.id,
                &UserId::from("u1"),
                MessageBody::plain("nope").unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        let text_msg = db
            .append_message(plain_message(&conv, "u1", "u2", "soon gone"))
            .unwrap();
        db.soft_delete_message(&text_msg.id, &UserId::from("u1")).unwrap();
        let err = db
            .edit_message(
                &text_msg.id,
                &UserId::from("u1"),
                MessageBody::plain("resurrect").unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[test]
    fn soft_delete_hides_from_listing_but_keeps_row() {
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        let stored = db
            .append_message(plain_message(&conv, "u1", "u2", "going"))
            .unwrap();

        // Receiver may delete too.
        db.soft_delete_message(&stored.id, &b).unwrap();

        assert!(db.list_messages_between(&a, &b, 50, 0).unwrap().is_empty());
        // Row still exists for the audit path.
        assert!(db.get_message(&stored.id).unwrap().is_deleted);

        // A third party may not delete.
        let other = db
            .append_message(plain_message(&conv, "u1", "u2", "staying"))
            .unwrap();
        let err = db
            .soft_delete_message(&other.id, &UserId::from("eve"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[test]
    fn read_status_is_not_deletion() {
        // Marking read keeps the message listed.
        let (_dir, db) = test_db();
        let conv = setup_conversation(&db);
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        db.append_message(plain_message(&conv, "u1", "u2", "hello")).unwrap();
        db.mark_read(&b, &a).unwrap();
        db.mark_conversation_read(&conv, &b).unwrap();

        let conv_rec = db.get_conversation(&conv).unwrap();
        assert_eq!(conv_rec.unread_for(&b), 0);
        assert_eq!(db.list_messages_between(&a, &b, 50, 0).unwrap().len(), 1);
    }
}
