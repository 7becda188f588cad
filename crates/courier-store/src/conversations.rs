//! Conversation Store.
//!
//! Maps an unordered participant pair to a canonical conversation record
//! and owns the per-participant unread counters, the denormalized
//! last-message preview, and the per-user soft-delete markers.
//!
//! Every mutation here is a single SQL statement. The unread counters in
//! particular are never read-modify-written from application code, which
//! is what keeps concurrent sends from losing increments.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::protocol::LastMessagePreview;
use courier_shared::types::{ConversationId, MessageKind, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Message};

impl Database {
    /// Look up the conversation for a pair, creating it if absent.
    ///
    /// Safe under concurrent invocation for the same pair: the canonical
    /// id is the primary key, the insert is `ON CONFLICT DO NOTHING`, and
    /// every caller re-selects afterwards, so all racers observe the one
    /// row the first writer created.
    pub fn find_or_create_conversation(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Conversation> {
        if user_a == user_b {
            return Err(StoreError::Validation(
                "a conversation requires two distinct participants".into(),
            ));
        }

        let id = ConversationId::canonical(user_a, user_b);
        let (lo, hi) = if user_a.as_str() < user_b.as_str() {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        let inserted = self.conn().execute(
            "INSERT INTO conversations (id, participant_lo, participant_hi, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![
                id.as_str(),
                lo.as_str(),
                hi.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if inserted > 0 {
            tracing::debug!(conversation = %id, "created conversation");
        }

        self.get_conversation(&id)
    }

    /// Fetch a conversation by canonical id.
    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, participant_lo, participant_hi,
                        last_sender, last_content, last_kind, last_timestamp,
                        unread_lo, unread_hi, deleted_lo, deleted_hi, created_at
                 FROM conversations
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Overwrite the last-message preview and increment the *receiver's*
    /// unread counter by exactly one, atomically.
    ///
    /// The CASE expressions route the increment to whichever sorted slot
    /// the receiver occupies; the whole thing is one UPDATE so concurrent
    /// sends in both directions interleave without lost increments.
    pub fn update_last_message(&self, message: &Message) -> Result<()> {
        let preview = message.body.preview();
        let updated = self.conn().execute(
            "UPDATE conversations SET
                 last_sender    = ?2,
                 last_content   = ?3,
                 last_kind      = ?4,
                 last_timestamp = ?5,
                 unread_lo = unread_lo + (CASE WHEN participant_lo = ?6 THEN 1 ELSE 0 END),
                 unread_hi = unread_hi + (CASE WHEN participant_hi = ?6 THEN 1 ELSE 0 END)
             WHERE id = ?1",
            params![
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                preview,
                message.kind.as_str(),
                message.created_at.to_rfc3339(),
                message.receiver_id.as_str(),
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Reset one participant's unread counter to zero. Idempotent.
    pub fn mark_conversation_read(&self, id: &ConversationId, user: &UserId) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE conversations SET
                 unread_lo = CASE WHEN participant_lo = ?2 THEN 0 ELSE unread_lo END,
                 unread_hi = CASE WHEN participant_hi = ?2 THEN 0 ELSE unread_hi END
             WHERE id = ?1",
            params![id.as_str(), user.as_str()],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// All conversations containing the user, excluding ones the user has
    /// soft-deleted, newest activity first.
    pub fn list_conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, participant_lo, participant_hi,
                    last_sender, last_content, last_kind, last_timestamp,
                    unread_lo, unread_hi, deleted_lo, deleted_hi, created_at
             FROM conversations
             WHERE (participant_lo = ?1 AND deleted_lo = 0)
                OR (participant_hi = ?1 AND deleted_hi = 0)
             ORDER BY COALESCE(last_timestamp, created_at) DESC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Add the user to the conversation's deletion set. No-op if already
    /// present; the record itself is never physically removed while the
    /// other participant may still reference it.
    pub fn soft_delete_conversation(&self, id: &ConversationId, user: &UserId) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE conversations SET
                 deleted_lo = CASE WHEN participant_lo = ?2 THEN 1 ELSE deleted_lo END,
                 deleted_hi = CASE WHEN participant_hi = ?2 THEN 1 ELSE deleted_hi END
             WHERE id = ?1",
            params![id.as_str(), user.as_str()],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Total unread messages across all non-deleted conversations for a
    /// user, for the aggregate badge count.
    pub fn total_unread_for_user(&self, user: &UserId) -> Result<u32> {
        let total: u32 = self.conn().query_row(
            "SELECT COALESCE(SUM(
                 CASE WHEN participant_lo = ?1 THEN unread_lo
                      WHEN participant_hi = ?1 THEN unread_hi
                      ELSE 0 END), 0)
             FROM conversations
             WHERE (participant_lo = ?1 AND deleted_lo = 0)
                OR (participant_hi = ?1 AND deleted_hi = 0)",
            params![user.as_str()],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let lo: String = row.get(1)?;
    let hi: String = row.get(2)?;
    let last_sender: Option<String> = row.get(3)?;
    let last_content: Option<String> = row.get(4)?;
    let last_kind: Option<String> = row.get(5)?;
    let last_timestamp: Option<String> = row.get(6)?;
    let unread_lo: u32 = row.get(7)?;
    let unread_hi: u32 = row.get(8)?;
    let deleted_lo: bool = row.get(9)?;
    let deleted_hi: bool = row.get(10)?;
    let created_str: String = row.get(11)?;

    let created_at = parse_ts(&created_str, 11)?;

    // The preview is either fully present or fully absent.
    let last_message = match (last_sender, last_content, last_kind, last_timestamp) {
        (Some(sender), Some(content), Some(kind), Some(ts)) => Some(LastMessagePreview {
            sender_id: UserId::new(sender),
            content,
            kind: MessageKind::from_str(&kind).unwrap_or(MessageKind::Text),
            timestamp: parse_ts(&ts, 6)?,
        }),
        _ => None,
    };

    Ok(Conversation {
        id: ConversationId(id),
        participant_lo: UserId::new(lo),
        participant_hi: UserId::new(hi),
        last_message,
        unread_lo,
        unread_hi,
        deleted_lo,
        deleted_hi,
        created_at,
    })
}

fn parse_ts(s: &str, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::envelope::MessageBody;
    use courier_shared::types::MessageId;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("conv.db")).unwrap();
        (dir, db)
    }

    fn message(conv: &Conversation, sender: &str, receiver: &str, text: &str) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: conv.id.clone(),
            sender_id: UserId::from(sender),
            receiver_id: UserId::from(receiver),
            kind: MessageKind::Text,
            body: MessageBody::plain(text).unwrap(),
            file: None,
            is_delivered: false,
            delivered_at: None,
            is_read: false,
            read_at: None,
            client_token: None,
            is_deleted: false,
            is_edited: false,
            edited_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn find_or_create_is_symmetric() {
        let (_dir, db) = test_db();
        let a = UserId::from("u1");
        let b = UserId::from("u2");

        let c1 = db.find_or_create_conversation(&a, &b).unwrap();
        let c2 = db.find_or_create_conversation(&b, &a).unwrap();

        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.unread_lo, 0);
        assert_eq!(c1.unread_hi, 0);
    }

    #[test]
    fn same_user_pair_rejected() {
        let (_dir, db) = test_db();
        let a = UserId::from("u1");
        assert!(matches!(
            db.find_or_create_conversation(&a, &a),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn concurrent_find_or_create_converges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        // Materialize the schema before the racers start.
        Database::open_at(&path).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let db = Database::open_at(&path).unwrap();
                db.find_or_create_conversation(&UserId::from("u1"), &UserId::from("u2"))
                    .unwrap()
                    .id
            }));
        }

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let db = Database::open_at(&path).unwrap();
        let count: u32 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn update_last_message_increments_receiver_only() {
        let (_dir, db) = test_db();
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        let conv = db.find_or_create_conversation(&a, &b).unwrap();

        // u1 sends "hello"; u2's counter goes to 1, u1's stays 0.
        let msg = message(&conv, "u1", "u2", "hello");
        db.update_last_message(&msg).unwrap();

        let conv = db.get_conversation(&conv.id).unwrap();
        assert_eq!(conv.unread_for(&b), 1);
        assert_eq!(conv.unread_for(&a), 0);
        let preview = conv.last_message.as_ref().unwrap();
        assert_eq!(preview.content, "hello");
        assert_eq!(preview.sender_id, a);
    }

    #[test]
    fn unread_is_monotonic_under_bidirectional_sends() {
        let (_dir, db) = test_db();
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        let conv = db.find_or_create_conversation(&a, &b).unwrap();

        // K messages b -> a interleaved with sends a -> b; a's counter
        // must end at exactly K.
        for i in 0..5 {
            db.update_last_message(&message(&conv, "u2", "u1", &format!("to-a {i}")))
                .unwrap();
            db.update_last_message(&message(&conv, "u1", "u2", &format!("to-b {i}")))
                .unwrap();
        }

        let conv = db.get_conversation(&conv.id).unwrap();
        assert_eq!(conv.unread_for(&a), 5);
        assert_eq!(conv.unread_for(&b), 5);
    }

    #[test]
    fn mark_read_resets_to_zero_and_is_idempotent() {
        let (_dir, db) = test_db();
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        let conv = db.find_or_create_conversation(&a, &b).unwrap();

        db.update_last_message(&message(&conv, "u1", "u2", "one")).unwrap();
        db.update_last_message(&message(&conv, "u1", "u2", "two")).unwrap();

        db.mark_conversation_read(&conv.id, &b).unwrap();
        db.mark_conversation_read(&conv.id, &b).unwrap();

        let conv = db.get_conversation(&conv.id).unwrap();
        assert_eq!(conv.unread_for(&b), 0);
        // The sender's counter is untouched.
        assert_eq!(conv.unread_for(&a), 0);
    }

    #[test]
    fn listing_orders_by_activity_and_respects_soft_delete() {
        let (_dir, db) = test_db();
        let me = UserId::from("me");

        let with_x = db
            .find_or_create_conversation(&me, &UserId::from("x"))
            .unwrap();
        let with_y = db
            .find_or_create_conversation(&me, &UserId::from("y"))
            .unwrap();

        db.update_last_message(&message(&with_x, "x", "me", "older")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.update_last_message(&message(&with_y, "y", "me", "newer")).unwrap();

        let listed = db.list_conversations_for_user(&me).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, with_y.id);

        db.soft_delete_conversation(&with_x.id, &me).unwrap();
        let listed = db.list_conversations_for_user(&me).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, with_y.id);

        // The other participant still sees the soft-deleted conversation.
        let for_x = db.list_conversations_for_user(&UserId::from("x")).unwrap();
        assert_eq!(for_x.len(), 1);
    }

    #[test]
    fn total_unread_sums_across_conversations() {
        let (_dir, db) = test_db();
        let me = UserId::from("me");

        let with_x = db
            .find_or_create_conversation(&me, &UserId::from("x"))
            .unwrap();
        let with_y = db
            .find_or_create_conversation(&me, &UserId::from("y"))
            .unwrap();

        db.update_last_message(&message(&with_x, "x", "me", "a")).unwrap();
        db.update_last_message(&message(&with_x, "x", "me", "b")).unwrap();
        db.update_last_message(&message(&with_y, "y", "me", "c")).unwrap();

        assert_eq!(db.total_unread_for_user(&me).unwrap(), 3);
    }

    #[test]
    fn missing_conversation_is_not_found() {
        let (_dir, db) = test_db();
        let id = ConversationId("a_b".into());
        assert!(matches!(db.get_conversation(&id), Err(StoreError::NotFound)));
        assert!(matches!(
            db.mark_conversation_read(&id, &UserId::from("a")),
            Err(StoreError::NotFound)
        ));
    }
}
