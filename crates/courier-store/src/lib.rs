//! # courier-store
//!
//! SQLite-backed persistence for the Courier chat core: the key directory,
//! the conversation store, and the append-only message log.
//!
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection` with typed helpers for every domain model. All
//! counter updates and the conversation find-or-create are single SQL
//! statements, so they stay atomic under concurrent callers even when the
//! application layer holds no lock.

pub mod conversations;
pub mod database;
pub mod keys;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod pool;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use pool::{DatabasePool, PooledConnection};
