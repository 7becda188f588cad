//! The dual-mode message body.
//!
//! A message carries *either* plaintext (simplified mode) *or* an encrypted
//! envelope. The content-presence invariant is enforced at construction
//! time: there is no way to build a [`MessageBody`] with neither.

use serde::{Deserialize, Serialize};

use crate::constants::PREVIEW_MAX_CHARS;
use crate::error::EnvelopeError;

/// Message content, tagged by operating mode.
///
/// Encrypted fields are base64 strings and opaque to the server: the
/// ciphertext, the symmetric key wrapped for the recipient, and the IV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum MessageBody {
    /// Simplified mode: content stored and transmitted as plaintext.
    #[serde(rename_all = "camelCase")]
    Plain { content: String },
    /// End-to-end encrypted envelope.
    #[serde(rename_all = "camelCase")]
    Encrypted {
        encrypted_content: String,
        encrypted_key: String,
        iv: String,
    },
}

impl MessageBody {
    /// Build a simplified-mode body. Rejects empty content.
    pub fn plain(content: impl Into<String>) -> Result<Self, EnvelopeError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(EnvelopeError::EmptyPlaintext);
        }
        Ok(Self::Plain { content })
    }

    /// Build an encrypted-mode body. All three envelope fields are required;
    /// a missing one is reported by name so validation errors are actionable.
    pub fn encrypted(
        encrypted_content: impl Into<String>,
        encrypted_key: impl Into<String>,
        iv: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let encrypted_content = encrypted_content.into();
        let encrypted_key = encrypted_key.into();
        let iv = iv.into();
        if encrypted_content.is_empty() {
            return Err(EnvelopeError::MissingEnvelopeField("encryptedContent"));
        }
        if encrypted_key.is_empty() {
            return Err(EnvelopeError::MissingEnvelopeField("encryptedKey"));
        }
        if iv.is_empty() {
            return Err(EnvelopeError::MissingEnvelopeField("iv"));
        }
        Ok(Self::Encrypted {
            encrypted_content,
            encrypted_key,
            iv,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }

    /// Truncated preview text for the conversation's last-message field.
    /// Encrypted bodies never leak content into the preview.
    pub fn preview(&self) -> String {
        match self {
            Self::Plain { content } => truncate_chars(content, PREVIEW_MAX_CHARS),
            Self::Encrypted { .. } => "[encrypted message]".to_string(),
        }
    }
}

/// Truncate at a character boundary (not a byte boundary).
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rejects_empty() {
        assert_eq!(
            MessageBody::plain("   "),
            Err(EnvelopeError::EmptyPlaintext)
        );
        assert!(MessageBody::plain("hello").is_ok());
    }

    #[test]
    fn encrypted_requires_all_fields() {
        assert_eq!(
            MessageBody::encrypted("ct", "", "iv"),
            Err(EnvelopeError::MissingEnvelopeField("encryptedKey"))
        );
        assert_eq!(
            MessageBody::encrypted("", "key", "iv"),
            Err(EnvelopeError::MissingEnvelopeField("encryptedContent"))
        );
        assert_eq!(
            MessageBody::encrypted("ct", "key", ""),
            Err(EnvelopeError::MissingEnvelopeField("iv"))
        );
        assert!(MessageBody::encrypted("ct", "key", "iv").is_ok());
    }

    #[test]
    fn preview_truncates_plaintext() {
        let long = "x".repeat(200);
        let body = MessageBody::plain(long).unwrap();
        let preview = body.preview();
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + 1); // + ellipsis
    }

    #[test]
    fn preview_never_leaks_ciphertext() {
        let body = MessageBody::encrypted("c2VjcmV0", "a2V5", "aXY=").unwrap();
        assert_eq!(body.preview(), "[encrypted message]");
    }

    #[test]
    fn serde_tags_by_mode() {
        let body = MessageBody::plain("hi").unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["mode"], "plain");
        assert_eq!(json["content"], "hi");

        let body = MessageBody::encrypted("ct", "key", "iv").unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["mode"], "encrypted");
        assert_eq!(json["encryptedKey"], "key");
    }
}
