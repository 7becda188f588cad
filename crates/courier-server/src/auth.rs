//! Session credential verification.
//!
//! The surrounding account system owns login; it hands out opaque session
//! tokens and registers them here. The chat core only checks that a token
//! maps to the claimed user.
//!
//! A connection whose credential is missing or does not verify is NOT
//! rejected: it is accepted in a reduced-capability *minimal* mode keyed
//! only by the claimed user id. This keeps chat available when the
//! credential path itself is degraded, and is a deliberate
//! availability-over-strict-auth tradeoff; see the session state machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use courier_shared::types::{SenderProfile, UserId};

/// How a live session was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Credential verified against the token registry.
    Full,
    /// Credential missing or unverifiable; identity taken on faith from
    /// the claimed user id. Participant checks and read-receipt side
    /// effects are skipped for these sessions.
    Minimal,
}

/// Registry of live session tokens, populated by the account system.
#[derive(Clone, Default)]
pub struct SessionTokens {
    inner: Arc<RwLock<HashMap<String, UserId>>>,
}

impl SessionTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a user (called by the account collaborator
    /// when it establishes a web session).
    pub fn insert(&self, token: impl Into<String>, user: UserId) {
        self.inner
            .write()
            .expect("token registry lock poisoned")
            .insert(token.into(), user);
    }

    pub fn revoke(&self, token: &str) {
        self.inner
            .write()
            .expect("token registry lock poisoned")
            .remove(token);
    }

    /// Resolve a connection attempt to an auth mode.
    ///
    /// Full auth requires the token to exist *and* to match the claimed
    /// user; anything else degrades to minimal rather than rejecting.
    pub fn verify(&self, token: Option<&str>, claimed: &UserId) -> AuthMode {
        let registry = self.inner.read().expect("token registry lock poisoned");
        match token.and_then(|t| registry.get(t)) {
            Some(owner) if owner == claimed => AuthMode::Full,
            _ => AuthMode::Minimal,
        }
    }
}

/// Cache of sender display profiles supplied by the identity collaborator,
/// so the delivery path never re-queries the account system per send.
#[derive(Clone, Default)]
pub struct ProfileDirectory {
    inner: Arc<RwLock<HashMap<UserId, SenderProfile>>>,
}

impl ProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: SenderProfile) {
        self.inner
            .write()
            .expect("profile directory lock poisoned")
            .insert(profile.id.clone(), profile);
    }

    pub fn get(&self, user: &UserId) -> Option<SenderProfile> {
        self.inner
            .read()
            .expect("profile directory lock poisoned")
            .get(user)
            .cloned()
    }
}
