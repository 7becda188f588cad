use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Plaintext content must not be empty")]
    EmptyPlaintext,

    #[error("Encrypted envelope is missing a required field: {0}")]
    MissingEnvelopeField(&'static str),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid IV length: expected {expected}, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}
