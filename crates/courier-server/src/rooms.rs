//! Room registry: which live sessions receive which broadcasts.
//!
//! A room is a named broadcast group, either a per-user room (for direct
//! addressing) or a per-conversation room. The registry maps room id to
//! the outbound channels of the sessions joined to it, and is mutated
//! only through join/leave; no other component touches the map.
//!
//! Broadcast is fire-and-forget: a send never waits for the recipient,
//! and a dead channel is pruned on the next touch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use courier_shared::protocol::ServerEvent;
use courier_shared::types::{ConversationId, UserId};

/// Identifier of a live connection.
pub type SessionId = Uuid;

/// Outbound channel of a session; the ws task on the other end pumps
/// these events onto the socket.
pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    /// Per-user room, joined automatically on connect.
    User(UserId),
    /// Per-conversation room, joined explicitly.
    Conversation(ConversationId),
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomId::User(u) => write!(f, "user:{u}"),
            RoomId::Conversation(c) => write!(f, "conversation:{c}"),
        }
    }
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, HashMap<SessionId, OutboundSender>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a session to a room.
    pub fn join(&self, room: RoomId, session: SessionId, tx: OutboundSender) {
        let mut rooms = self.rooms.write().expect("room registry lock poisoned");
        rooms.entry(room.clone()).or_default().insert(session, tx);
        tracing::debug!(room = %room, session = %session, "session joined room");
    }

    /// Remove a session from one room.
    pub fn leave(&self, room: &RoomId, session: &SessionId) {
        let mut rooms = self.rooms.write().expect("room registry lock poisoned");
        if let Some(members) = rooms.get_mut(room) {
            members.remove(session);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Remove a session from every room it joined (disconnect path).
    pub fn leave_all(&self, session: &SessionId) {
        let mut rooms = self.rooms.write().expect("room registry lock poisoned");
        rooms.retain(|_, members| {
            members.remove(session);
            !members.is_empty()
        });
    }

    /// Whether any session is currently joined to the room.
    pub fn is_occupied(&self, room: &RoomId) -> bool {
        self.rooms
            .read()
            .expect("room registry lock poisoned")
            .get(room)
            .is_some_and(|members| !members.is_empty())
    }

    /// Broadcast an event to every session in a room, skipping one
    /// session if requested (typically the originator). Returns the
    /// number of sessions the event was handed to. Dead channels are
    /// pruned as they are found.
    pub fn broadcast(&self, room: &RoomId, event: &ServerEvent, except: Option<&SessionId>) -> usize {
        let mut rooms = self.rooms.write().expect("room registry lock poisoned");
        let Some(members) = rooms.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead: HashSet<SessionId> = HashSet::new();

        for (session, tx) in members.iter() {
            if Some(session) == except {
                continue;
            }
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.insert(*session);
            }
        }

        for session in dead {
            members.remove(&session);
        }
        if members.is_empty() {
            rooms.remove(room);
        }

        delivered
    }

    /// Convenience: broadcast into a user's personal room. Returns true
    /// if at least one live session received it.
    pub fn send_to_user(&self, user: &UserId, event: &ServerEvent) -> bool {
        self.broadcast(&RoomId::User(user.clone()), event, None) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> (OutboundSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn broadcast_reaches_all_members_except_origin() {
        let registry = RoomRegistry::new();
        let room = RoomId::Conversation(ConversationId("a_b".into()));

        let (tx1, mut rx1) = subscriber();
        let (tx2, mut rx2) = subscriber();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        registry.join(room.clone(), s1, tx1);
        registry.join(room.clone(), s2, tx2);

        let delivered = registry.broadcast(&room, &ServerEvent::HeartbeatAck, Some(&s1));
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn leave_all_removes_session_everywhere() {
        let registry = RoomRegistry::new();
        let user_room = RoomId::User(UserId::from("u1"));
        let conv_room = RoomId::Conversation(ConversationId("a_b".into()));

        let (tx, _rx) = subscriber();
        let session = Uuid::new_v4();
        registry.join(user_room.clone(), session, tx.clone());
        registry.join(conv_room.clone(), session, tx);

        assert!(registry.is_occupied(&user_room));
        registry.leave_all(&session);
        assert!(!registry.is_occupied(&user_room));
        assert!(!registry.is_occupied(&conv_room));
    }

    #[test]
    fn dead_channels_are_pruned() {
        let registry = RoomRegistry::new();
        let room = RoomId::User(UserId::from("u1"));

        let (tx, rx) = subscriber();
        drop(rx); // receiver gone: channel is dead
        registry.join(room.clone(), Uuid::new_v4(), tx);

        assert_eq!(registry.broadcast(&room, &ServerEvent::HeartbeatAck, None), 0);
        assert!(!registry.is_occupied(&room));
    }

    #[test]
    fn send_to_user_reports_liveness() {
        let registry = RoomRegistry::new();
        let user = UserId::from("u1");

        assert!(!registry.send_to_user(&user, &ServerEvent::HeartbeatAck));

        let (tx, mut rx) = subscriber();
        registry.join(RoomId::User(user.clone()), Uuid::new_v4(), tx);
        assert!(registry.send_to_user(&user, &ServerEvent::HeartbeatAck));
        assert!(rx.try_recv().is_ok());
    }
}
