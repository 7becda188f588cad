//! Transport session state machine.
//!
//! One [`Session`] exists per live connection:
//!
//! ```text
//! Connecting -> Authenticating -> Authenticated(Full | Minimal)
//!                                      |  heartbeat timeout / disconnect
//!                                      v
//!                                   Closed(reason)
//! ```
//!
//! A connection that fails credential verification is not rejected; it
//! lands in `Authenticated` with [`AuthMode::Minimal`] and keeps working
//! with reduced guarantees (no participant checks, no read-receipt side
//! effects). Liveness is driven by heartbeats: the ws task sweeps the
//! session on an interval and closes it when the inactivity window is
//! exceeded.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use uuid::Uuid;

use courier_shared::types::{SenderProfile, UserId};

use crate::auth::AuthMode;
use crate::rooms::{RoomId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client disconnected explicitly (or the socket dropped).
    ClientDisconnect,
    /// No heartbeat within the inactivity window.
    HeartbeatTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated(AuthMode),
    Closed(CloseReason),
}

/// Per-connection state owned by the ws task.
pub struct Session {
    pub id: SessionId,
    pub user: UserId,
    pub profile: Option<SenderProfile>,
    state: SessionState,
    joined: HashSet<RoomId>,
    last_heartbeat: Instant,
}

impl Session {
    /// A freshly accepted connection claiming to be `user`.
    pub fn connecting(user: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            profile: None,
            state: SessionState::Connecting,
            joined: HashSet::new(),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Credential verification has started.
    pub fn begin_auth(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Authenticating;
    }

    /// Credential verification finished; the session is live in either
    /// full or minimal mode and the inactivity clock starts now.
    pub fn authenticated(&mut self, mode: AuthMode) {
        debug_assert_eq!(self.state, SessionState::Authenticating);
        self.state = SessionState::Authenticated(mode);
        self.last_heartbeat = Instant::now();
    }

    pub fn auth_mode(&self) -> Option<AuthMode> {
        match self.state {
            SessionState::Authenticated(mode) => Some(mode),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Authenticated(_))
    }

    /// Record a heartbeat, resetting the inactivity timer.
    pub fn record_heartbeat(&mut self) {
        self.record_heartbeat_at(Instant::now());
    }

    pub fn record_heartbeat_at(&mut self, at: Instant) {
        self.last_heartbeat = at;
    }

    /// Whether the inactivity window has elapsed as of `now`.
    pub fn heartbeat_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.is_live() && now.duration_since(self.last_heartbeat) >= timeout
    }

    /// Track a joined room so disconnect can leave them all.
    pub fn joined_room(&mut self, room: RoomId) {
        self.joined.insert(room);
    }

    pub fn rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.joined.iter()
    }

    /// Terminal transition. Idempotent: the first reason wins.
    pub fn close(&mut self, reason: CloseReason) {
        if !matches!(self.state, SessionState::Closed(_)) {
            self.state = SessionState::Closed(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_session(mode: AuthMode) -> Session {
        let mut session = Session::connecting(UserId::from("u1"));
        session.begin_auth();
        session.authenticated(mode);
        session
    }

    #[test]
    fn happy_path_transitions() {
        let mut session = Session::connecting(UserId::from("u1"));
        assert_eq!(session.state(), SessionState::Connecting);

        session.begin_auth();
        assert_eq!(session.state(), SessionState::Authenticating);

        session.authenticated(AuthMode::Full);
        assert_eq!(session.state(), SessionState::Authenticated(AuthMode::Full));
        assert!(session.is_live());
        assert_eq!(session.auth_mode(), Some(AuthMode::Full));
    }

    #[test]
    fn failed_credential_lands_in_minimal_not_closed() {
        let session = live_session(AuthMode::Minimal);
        assert!(session.is_live());
        assert_eq!(session.auth_mode(), Some(AuthMode::Minimal));
    }

    #[test]
    fn heartbeat_timeout_detection() {
        let timeout = Duration::from_secs(60);
        let mut session = live_session(AuthMode::Full);

        let start = Instant::now();
        session.record_heartbeat_at(start);

        assert!(!session.heartbeat_expired(start + Duration::from_secs(59), timeout));
        assert!(session.heartbeat_expired(start + Duration::from_secs(60), timeout));

        // A heartbeat in between resets the window.
        session.record_heartbeat_at(start + Duration::from_secs(50));
        assert!(!session.heartbeat_expired(start + Duration::from_secs(100), timeout));
        assert!(session.heartbeat_expired(start + Duration::from_secs(110), timeout));
    }

    #[test]
    fn closed_session_never_expires_again() {
        let timeout = Duration::from_secs(1);
        let mut session = live_session(AuthMode::Full);
        let start = Instant::now();
        session.record_heartbeat_at(start);

        session.close(CloseReason::HeartbeatTimeout);
        assert_eq!(
            session.state(),
            SessionState::Closed(CloseReason::HeartbeatTimeout)
        );
        assert!(!session.heartbeat_expired(start + Duration::from_secs(500), timeout));

        // First close reason sticks.
        session.close(CloseReason::ClientDisconnect);
        assert_eq!(
            session.state(),
            SessionState::Closed(CloseReason::HeartbeatTimeout)
        );
    }

    #[test]
    fn rooms_are_tracked_for_disconnect() {
        let mut session = live_session(AuthMode::Full);
        session.joined_room(RoomId::User(UserId::from("u1")));
        session.joined_room(RoomId::Conversation(
            courier_shared::types::ConversationId("a_b".into()),
        ));
        assert_eq!(session.rooms().count(), 2);
    }
}
