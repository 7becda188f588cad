//! Identity & Key Directory.
//!
//! Stores one active public key + fingerprint per user. Registration and
//! rotation have the same storage effect (an in-place upsert); rotation is
//! kept as a distinct operation so audit logs show intent.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::constants::MIN_PUBLIC_KEY_LEN;
use courier_shared::crypto;
use courier_shared::types::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::UserKeyRecord;

impl Database {
    /// Register a user's public key, returning its fingerprint.
    ///
    /// Upserts the single key row for the user: the primary key on
    /// `user_id` is what guarantees at most one active key. Rejects key
    /// material shorter than a minimum plausible length before computing
    /// a fingerprint.
    pub fn register_key(&self, user_id: &UserId, public_key: &[u8]) -> Result<String> {
        if public_key.len() < MIN_PUBLIC_KEY_LEN {
            return Err(StoreError::Validation(format!(
                "public key too short: {} bytes (minimum {})",
                public_key.len(),
                MIN_PUBLIC_KEY_LEN
            )));
        }

        let fingerprint = crypto::fingerprint(public_key);
        let now = Utc::now();

        self.conn().execute(
            "INSERT INTO user_keys (user_id, public_key, fingerprint, last_rotated, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(user_id) DO UPDATE SET
                 public_key   = excluded.public_key,
                 fingerprint  = excluded.fingerprint,
                 last_rotated = excluded.last_rotated,
                 is_active    = 1",
            params![
                user_id.as_str(),
                public_key,
                fingerprint,
                now.to_rfc3339(),
            ],
        )?;

        tracing::info!(user = %user_id, fingerprint = %fingerprint, "registered public key");
        Ok(fingerprint)
    }

    /// Rotate a user's key. Identical storage effect to registration; the
    /// previous key is superseded in place, never left active alongside
    /// the new one.
    pub fn rotate_key(&self, user_id: &UserId, new_public_key: &[u8]) -> Result<String> {
        let fingerprint = self.register_key(user_id, new_public_key)?;
        tracing::info!(user = %user_id, fingerprint = %fingerprint, "rotated public key");
        Ok(fingerprint)
    }

    /// Fetch the active key record for a user.
    pub fn get_key(&self, user_id: &UserId) -> Result<UserKeyRecord> {
        self.conn()
            .query_row(
                "SELECT user_id, public_key, fingerprint, last_rotated, is_active
                 FROM user_keys
                 WHERE user_id = ?1 AND is_active = 1",
                params![user_id.as_str()],
                row_to_key_record,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Compare a fingerprint against the stored active one.
    ///
    /// Returns `false` (not an error) when the user has no active key, so
    /// verification flows degrade to "unverified" rather than failing.
    pub fn verify_fingerprint(&self, user_id: &UserId, fingerprint: &str) -> Result<bool> {
        match self.get_key(user_id) {
            Ok(record) => Ok(record.fingerprint == fingerprint),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn row_to_key_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserKeyRecord> {
    let user_id: String = row.get(0)?;
    let public_key: Vec<u8> = row.get(1)?;
    let fingerprint: String = row.get(2)?;
    let rotated_str: String = row.get(3)?;
    let is_active: bool = row.get(4)?;

    let last_rotated: DateTime<Utc> = DateTime::parse_from_rfc3339(&rotated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(UserKeyRecord {
        user_id: UserId::new(user_id),
        public_key,
        fingerprint,
        last_rotated,
        is_active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("keys.db")).unwrap();
        (dir, db)
    }

    fn key_material(fill: u8) -> Vec<u8> {
        vec![fill; 32]
    }

    #[test]
    fn register_then_get() {
        let (_dir, db) = test_db();
        let user = UserId::from("u1");

        let fp = db.register_key(&user, &key_material(0xAA)).unwrap();
        let record = db.get_key(&user).unwrap();

        assert_eq!(record.fingerprint, fp);
        assert_eq!(record.public_key, key_material(0xAA));
        assert!(record.is_active);
    }

    #[test]
    fn short_key_rejected_before_fingerprinting() {
        let (_dir, db) = test_db();
        let user = UserId::from("u1");

        let err = db.register_key(&user, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(matches!(db.get_key(&user), Err(StoreError::NotFound)));
    }

    #[test]
    fn rotation_supersedes_in_place() {
        let (_dir, db) = test_db();
        let user = UserId::from("u1");

        let fp1 = db.register_key(&user, &key_material(0x01)).unwrap();
        let fp2 = db.rotate_key(&user, &key_material(0x02)).unwrap();
        assert_ne!(fp1, fp2);

        // Exactly one row survives: no two simultaneously-active keys.
        let count: u32 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM user_keys WHERE user_id = ?1",
                params![user.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.get_key(&user).unwrap().fingerprint, fp2);
    }

    #[test]
    fn unknown_user_is_not_found() {
        let (_dir, db) = test_db();
        assert!(matches!(
            db.get_key(&UserId::from("ghost")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn verify_fingerprint_matches_active_only() {
        let (_dir, db) = test_db();
        let user = UserId::from("u1");

        let fp1 = db.register_key(&user, &key_material(0x01)).unwrap();
        assert!(db.verify_fingerprint(&user, &fp1).unwrap());

        let fp2 = db.rotate_key(&user, &key_material(0x02)).unwrap();
        assert!(!db.verify_fingerprint(&user, &fp1).unwrap());
        assert!(db.verify_fingerprint(&user, &fp2).unwrap());
    }

    #[test]
    fn verify_fingerprint_without_key_is_false_not_error() {
        let (_dir, db) = test_db();
        let verified = db
            .verify_fingerprint(&UserId::from("nobody"), "deadbeef")
            .unwrap();
        assert!(!verified);
    }
}
