//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `user_keys`, `conversations`, and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- User keys (one active record per user; rotation updates in place)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_keys (
    user_id      TEXT PRIMARY KEY NOT NULL,
    public_key   BLOB NOT NULL,               -- opaque key material
    fingerprint  TEXT NOT NULL,               -- BLAKE3 hex of public_key
    last_rotated TEXT NOT NULL,               -- ISO-8601 / RFC-3339
    is_active    INTEGER NOT NULL DEFAULT 1   -- boolean 0/1
);

-- ----------------------------------------------------------------
-- Conversations
--
-- The primary key is the canonical sorted-pair id, which is what makes
-- concurrent find-or-create converge: the losing INSERT is a no-op and
-- both callers re-select the single surviving row. Participants are
-- stored in sorted order (lo < hi) so the per-participant unread
-- counters and soft-delete flags address a fixed column.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id             TEXT PRIMARY KEY NOT NULL, -- "<lo>_<hi>"
    participant_lo TEXT NOT NULL,
    participant_hi TEXT NOT NULL,
    last_sender    TEXT,                      -- denormalized preview
    last_content   TEXT,
    last_kind      TEXT,
    last_timestamp TEXT,
    unread_lo      INTEGER NOT NULL DEFAULT 0,
    unread_hi      INTEGER NOT NULL DEFAULT 0,
    deleted_lo     INTEGER NOT NULL DEFAULT 0, -- soft-delete markers
    deleted_hi     INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,

    CHECK (participant_lo < participant_hi),
    CHECK (unread_lo >= 0 AND unread_hi >= 0)
);

CREATE INDEX IF NOT EXISTS idx_conversations_lo ON conversations(participant_lo);
CREATE INDEX IF NOT EXISTS idx_conversations_hi ON conversations(participant_hi);

-- ----------------------------------------------------------------
-- Messages (append-only; "deletes" flip is_deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id   TEXT NOT NULL,              -- FK -> conversations(id)
    sender_id         TEXT NOT NULL,
    receiver_id       TEXT NOT NULL,
    kind              TEXT NOT NULL,              -- text|image|file|emoji
    content           TEXT,                       -- plaintext (simplified mode)
    encrypted_content TEXT,                       -- base64 envelope fields
    encrypted_key     TEXT,
    iv                TEXT,
    file_name         TEXT,
    file_size         INTEGER,
    storage_path      TEXT,
    mime_type         TEXT,
    is_delivered      INTEGER NOT NULL DEFAULT 0,
    delivered_at      TEXT,
    is_read           INTEGER NOT NULL DEFAULT 0,
    read_at           TEXT,
    client_token      TEXT,                       -- idempotency token
    is_deleted        INTEGER NOT NULL DEFAULT 0,
    is_edited         INTEGER NOT NULL DEFAULT 0,
    edited_at         TEXT,
    created_at        TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    -- content-presence: at least one of the two content forms is set
    CHECK (content IS NOT NULL OR encrypted_content IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(sender_id, receiver_id, is_read);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
