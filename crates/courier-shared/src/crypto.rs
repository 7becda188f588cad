use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::NONCE_SIZE;
use crate::envelope::MessageBody;
use crate::error::{CryptoError, EnvelopeError};

pub type SymmetricKey = [u8; 32];

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// BLAKE3 content hash of public key material, hex-encoded. Used for
/// out-of-band fingerprint verification.
pub fn fingerprint(public_key: &[u8]) -> String {
    blake3::hash(public_key).to_hex().to_string()
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt plaintext under a fresh nonce. Returns `(ciphertext, nonce)`;
/// the nonce travels separately as the envelope's IV field.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((ciphertext, nonce_bytes))
}

pub fn open(key: &SymmetricKey, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidIvLength {
            expected: NONCE_SIZE,
            got: iv.len(),
        });
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(iv);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Assemble an encrypted [`MessageBody`] from plaintext.
///
/// `wrapped_key` is the symmetric key already encrypted for the recipient
/// by whatever asymmetric scheme the caller uses; this layer only requires
/// that it is non-empty.
pub fn seal_body(
    key: &SymmetricKey,
    wrapped_key: &[u8],
    plaintext: &str,
) -> Result<MessageBody, CryptoError> {
    let (ciphertext, nonce) = seal(key, plaintext.as_bytes())?;
    MessageBody::encrypted(
        B64.encode(ciphertext),
        B64.encode(wrapped_key),
        B64.encode(nonce),
    )
    .map_err(|e| match e {
        EnvelopeError::MissingEnvelopeField(_) => CryptoError::EncryptionFailed,
        EnvelopeError::EmptyPlaintext => CryptoError::EncryptionFailed,
    })
}

/// Recover the plaintext from an encrypted [`MessageBody`].
///
/// Returns `DecryptionFailed` when handed a plain body; callers should
/// check `is_encrypted()` first.
pub fn open_body(key: &SymmetricKey, body: &MessageBody) -> Result<String, CryptoError> {
    match body {
        MessageBody::Encrypted {
            encrypted_content,
            iv,
            ..
        } => {
            let ciphertext = B64.decode(encrypted_content)?;
            let iv = B64.decode(iv)?;
            let plaintext = open(key, &ciphertext, &iv)?;
            String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
        }
        MessageBody::Plain { .. } => Err(CryptoError::DecryptionFailed),
    }
}
