//! # courier-client
//!
//! Client-side delivery plumbing: a WebSocket transport with heartbeat
//! keepalive, a typed REST client mirroring the server's fallback
//! surface, and a reconnection controller that degrades to polling when
//! the live transport cannot be re-established.
//!
//! The server is duplicate-tolerant on reconnects; [`inbox::Inbox`]
//! reconciles by message id and client token so the consumer sees each
//! message once.

pub mod backoff;
pub mod controller;
pub mod inbox;
pub mod rest;
pub mod transport;

mod error;

pub use error::ClientError;
