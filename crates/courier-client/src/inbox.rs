//! Duplicate reconciliation for incoming messages.
//!
//! The server favors availability over exactly-once push: a message can
//! arrive twice when a reconnect overlaps a poll, or when fan-out reaches
//! both the user room and a joined conversation room. The inbox keeps a
//! bounded window of recently seen message ids and client tokens and
//! surfaces each message at most once.

use std::collections::{HashSet, VecDeque};

use courier_shared::protocol::MessagePayload;
use courier_shared::types::MessageId;

/// How many recently seen messages are remembered. Duplicates only arise
/// within a reconnect/poll window, so a shallow horizon is enough.
const DEFAULT_WINDOW: usize = 512;

#[derive(Debug)]
pub struct Inbox {
    window: usize,
    seen_ids: HashSet<MessageId>,
    seen_tokens: HashSet<(String, String)>,
    order: VecDeque<(MessageId, Option<(String, String)>)>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            window,
            seen_ids: HashSet::new(),
            seen_tokens: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Accept an incoming message, returning it if it has not been seen
    /// before. A duplicate is either a known message id, or a known
    /// (sender, client token) pair for sends retried across transports.
    pub fn accept(&mut self, message: MessagePayload) -> Option<MessagePayload> {
        if self.seen_ids.contains(&message.id) {
            return None;
        }

        let token_key = message
            .client_token
            .as_ref()
            .map(|t| (message.sender_id.as_str().to_string(), t.clone()));

        if let Some(key) = &token_key {
            if self.seen_tokens.contains(key) {
                return None;
            }
            self.seen_tokens.insert(key.clone());
        }

        self.seen_ids.insert(message.id);
        self.order.push_back((message.id, token_key));
        self.evict();

        Some(message)
    }

    fn evict(&mut self) {
        while self.order.len() > self.window {
            if let Some((id, token)) = self.order.pop_front() {
                self.seen_ids.remove(&id);
                if let Some(key) = token {
                    self.seen_tokens.remove(&key);
                }
            }
        }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_shared::envelope::MessageBody;
    use courier_shared::types::{ConversationId, MessageKind, UserId};

    fn message(token: Option<&str>) -> MessagePayload {
        MessagePayload {
            id: MessageId::new(),
            conversation_id: ConversationId("u1_u2".into()),
            sender_id: UserId::from("u1"),
            receiver_id: UserId::from("u2"),
            kind: MessageKind::Text,
            body: MessageBody::plain("hi").unwrap(),
            file: None,
            delivered: false,
            delivered_at: None,
            read: false,
            read_at: None,
            client_token: token.map(str::to_string),
            is_edited: false,
            edited_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn same_id_surfaces_once() {
        let mut inbox = Inbox::new();
        let m = message(None);

        assert!(inbox.accept(m.clone()).is_some());
        assert!(inbox.accept(m).is_none());
    }

    #[test]
    fn same_client_token_surfaces_once_across_ids() {
        // A send retried over REST after a ws timeout gets a fresh server
        // id but carries the same client token.
        let mut inbox = Inbox::new();
        let first = message(Some("tok-1"));
        let mut retry = message(Some("tok-1"));
        retry.id = MessageId::new();

        assert!(inbox.accept(first).is_some());
        assert!(inbox.accept(retry).is_none());
    }

    #[test]
    fn same_token_from_different_senders_is_not_a_duplicate() {
        let mut inbox = Inbox::new();
        let a = message(Some("tok-1"));
        let mut b = message(Some("tok-1"));
        b.id = MessageId::new();
        b.sender_id = UserId::from("u3");

        assert!(inbox.accept(a).is_some());
        assert!(inbox.accept(b).is_some());
    }

    #[test]
    fn window_eviction_forgets_old_entries() {
        let mut inbox = Inbox::with_window(2);
        let old = message(None);

        assert!(inbox.accept(old.clone()).is_some());
        assert!(inbox.accept(message(None)).is_some());
        assert!(inbox.accept(message(None)).is_some());

        // Evicted from the window, so it would surface again.
        assert!(inbox.accept(old).is_some());
    }
}
