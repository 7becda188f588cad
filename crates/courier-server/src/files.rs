//! File-message attachment storage.
//!
//! Uploaded files are validated (size bound, MIME allowlist, extension /
//! MIME cross-check) before being written to disk under a generated name;
//! the returned [`FileMeta`] is embedded in the message record.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::protocol::FileMeta;

use crate::error::ServerError;

/// Accepted attachment types: (extension, MIME type). The declared MIME
/// must agree with the file extension; a mismatch is rejected rather
/// than trusted either way.
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("zip", "application/zip"),
];

#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FileStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "failed to create file directory '{}': {e}",
                base_path.display()
            ))
        })?;

        info!(path = %base_path.display(), "file store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Validate an upload against the size bound and type table.
    /// Exposed separately so the multipart handler can reject before
    /// buffering hits the disk.
    pub fn validate(
        &self,
        file_name: &str,
        mime_type: &str,
        size: usize,
    ) -> Result<(), ServerError> {
        if size == 0 {
            return Err(ServerError::Validation("empty file".into()));
        }
        if size > self.max_size {
            return Err(ServerError::FileTooLarge {
                size,
                max: self.max_size,
            });
        }

        let extension = file_name
            .rsplit('.')
            .next()
            .filter(|ext| *ext != file_name)
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ServerError::Validation("file name has no extension".into()))?;

        let expected_mime = ALLOWED_TYPES
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|(_, mime)| *mime)
            .ok_or_else(|| {
                ServerError::Validation(format!("file type .{extension} is not accepted"))
            })?;

        if !mime_type.eq_ignore_ascii_case(expected_mime) {
            return Err(ServerError::Validation(format!(
                "MIME type {mime_type} does not match extension .{extension}"
            )));
        }

        Ok(())
    }

    /// Validate and persist an upload. The stored name is a UUID with the
    /// original extension, so user-supplied names never touch the
    /// filesystem.
    pub async fn store(
        &self,
        file_name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<FileMeta, ServerError> {
        self.validate(file_name, mime_type, data.len())?;

        let extension = file_name
            .rsplit('.')
            .next()
            .unwrap_or("bin")
            .to_ascii_lowercase();
        let stored_name = format!("{}.{extension}", Uuid::new_v4());
        let path = self.base_path.join(&stored_name);

        fs::write(&path, data).await.map_err(|e| {
            ServerError::Internal(format!("failed to write file {stored_name}: {e}"))
        })?;

        debug!(name = %file_name, stored = %stored_name, size = data.len(), "stored attachment");

        Ok(FileMeta {
            file_name: file_name.to_string(),
            file_size: data.len() as u64,
            storage_path: stored_name,
            mime_type: mime_type.to_string(),
        })
    }

    /// Read a stored attachment back by its storage name.
    pub async fn load(&self, storage_path: &str) -> Result<Vec<u8>, ServerError> {
        // Storage names are server-generated UUIDs; reject anything else.
        if storage_path.contains('/') || storage_path.contains("..") {
            return Err(ServerError::Validation("invalid storage path".into()));
        }
        fs::read(self.base_path.join(storage_path))
            .await
            .map_err(|_| ServerError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("files"), 1024).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn store_and_load_round_trip() {
        let (_dir, store) = store().await;

        let meta = store
            .store("photo.png", "image/png", b"fake png bytes")
            .await
            .unwrap();
        assert_eq!(meta.file_name, "photo.png");
        assert_eq!(meta.mime_type, "image/png");
        assert!(meta.storage_path.ends_with(".png"));

        let data = store.load(&meta.storage_path).await.unwrap();
        assert_eq!(data, b"fake png bytes");
    }

    #[tokio::test]
    async fn oversized_file_rejected() {
        let (_dir, store) = store().await;
        let big = vec![0u8; 2048];
        let err = store.store("big.png", "image/png", &big).await.unwrap_err();
        assert!(matches!(err, ServerError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn mime_extension_mismatch_rejected() {
        let (_dir, store) = store().await;
        let err = store
            .store("evil.png", "application/pdf", b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_extension_rejected() {
        let (_dir, store) = store().await;
        let err = store
            .store("script.exe", "application/octet-stream", b"mz")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));

        let err = store.store("noext", "text/plain", b"data").await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[tokio::test]
    async fn load_rejects_traversal() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.load("../secrets").await.unwrap_err(),
            ServerError::Validation(_)
        ));
    }
}
