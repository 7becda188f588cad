//! # courier-shared
//!
//! Types shared between the Courier chat server and its clients: user and
//! conversation identifiers, the dual-mode message envelope, the live
//! transport protocol events, content sanitisation, and the key
//! fingerprinting / envelope crypto helpers.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod protocol;
pub mod sanitize;
pub mod types;

mod error;

pub use error::{CryptoError, EnvelopeError};
