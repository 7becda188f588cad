//! WebSocket transport: one task per live connection.
//!
//! The upgrade handler authenticates the connection (degrading to minimal
//! mode rather than rejecting), auto-joins the user's personal room, then
//! multiplexes client events until the socket drops or the heartbeat
//! sweep declares the session dead.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_shared::protocol::{ClientEvent, ServerEvent};
use courier_shared::types::{SenderProfile, UserId};

use crate::api::AppState;
use crate::auth::AuthMode;
use crate::rooms::{OutboundSender, RoomId};
use crate::session::{CloseReason, Session};

/// Query parameters supplied on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: String,
    pub token: Option<String>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: AppState) {
    let user = UserId::new(params.user_id);
    let mut session = Session::connecting(user.clone());

    // Credential check. A failure degrades to minimal mode instead of
    // closing the connection (availability over strict auth).
    session.begin_auth();
    let mode = state.auth.verify(params.token.as_deref(), &user);
    session.authenticated(mode);

    if mode == AuthMode::Minimal {
        warn!(user = %user, session = %session.id, "session accepted in minimal-auth mode");
    } else {
        info!(user = %user, session = %session.id, "session authenticated");
    }

    if let Some(display_name) = params.display_name {
        let profile = SenderProfile {
            id: user.clone(),
            display_name,
            avatar_ref: params.avatar,
        };
        state.profiles.upsert(profile.clone());
        session.profile = Some(profile);
    }

    // Outbound pump: everything addressed to this session flows through
    // one channel so room broadcasts never block on the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        // Flush the close frame if the socket is still up.
        let _ = sink.close().await;
    });

    // Direct addressing: every session sits in its user's personal room.
    let own_room = RoomId::User(user.clone());
    state.rooms.join(own_room.clone(), session.id, tx.clone());
    session.joined_room(own_room);

    // Heartbeat sweep, independent of any request/response activity.
    let sweep_period = state.config.heartbeat_timeout / 4;
    let mut sweep = tokio::time::interval(sweep_period.max(std::time::Duration::from_secs(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                handle_client_event(&mut session, &state, &tx, event).await;
                            }
                            Err(e) => {
                                debug!(session = %session.id, error = %e, "undecodable client event");
                                let _ = tx.send(ServerEvent::error("validation", "unrecognized event"));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break CloseReason::ClientDisconnect,
                    Some(Ok(_)) => {} // binary/ping/pong frames: ignored
                    Some(Err(e)) => {
                        debug!(session = %session.id, error = %e, "socket error");
                        break CloseReason::ClientDisconnect;
                    }
                }
            }
            _ = sweep.tick() => {
                if session.heartbeat_expired(std::time::Instant::now(), state.config.heartbeat_timeout) {
                    break CloseReason::HeartbeatTimeout;
                }
            }
        }
    };

    teardown(&mut session, &state, reason);
    writer.abort();
}

/// Dispatch one decoded client event against the session.
pub(crate) async fn handle_client_event(
    session: &mut Session,
    state: &AppState,
    tx: &OutboundSender,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Heartbeat => {
            session.record_heartbeat();
            let _ = tx.send(ServerEvent::HeartbeatAck);
        }

        ClientEvent::Ping { nonce } => {
            // Liveness probe with a correlated reply; deliberately does
            // not reset the heartbeat timer.
            let _ = tx.send(ServerEvent::Pong { nonce });
        }

        ClientEvent::JoinConversation { conversation_id } => {
            match session.auth_mode() {
                Some(AuthMode::Full) => {
                    // Verify membership before joining, then flush read
                    // receipts for the other participant's messages.
                    let user = session.user.clone();
                    let id = conversation_id.clone();
                    let is_participant = state
                        .delivery
                        .with_store(move |db| {
                            Ok(match db.get_conversation(&id) {
                                Ok(conversation) => conversation.contains(&user),
                                Err(_) => false,
                            })
                        })
                        .await
                        .unwrap_or(false);
                    if !is_participant {
                        let _ = tx.send(ServerEvent::error(
                            "forbidden",
                            "not a participant of this conversation",
                        ));
                        return;
                    }

                    let room = RoomId::Conversation(conversation_id.clone());
                    state.rooms.join(room.clone(), session.id, tx.clone());
                    session.joined_room(room);

                    if let Err(e) = state.delivery.mark_read(&session.user, &conversation_id).await {
                        debug!(session = %session.id, error = %e, "read flush on join failed");
                    }
                }
                Some(AuthMode::Minimal) => {
                    // Participant verification is unavailable: join
                    // unconditionally, skip the read-receipt side effect.
                    let room = RoomId::Conversation(conversation_id);
                    state.rooms.join(room.clone(), session.id, tx.clone());
                    session.joined_room(room);
                }
                None => {
                    let _ = tx.send(ServerEvent::error("transport", "session is not live"));
                }
            }
        }

        ClientEvent::SendMessage(req) => {
            match state.delivery.send(&session.user, req, Some(&session.id)).await {
                Ok(stored) => {
                    // Send acknowledgement, correlated by the payload's
                    // client token.
                    let _ = tx.send(ServerEvent::MessageSent {
                        message: stored.into(),
                    });
                }
                Err(e) => {
                    let _ = tx.send(ServerEvent::error(e.code(), e.to_string()));
                }
            }
        }

        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => {
            // Fire-and-forget; never persisted.
            state.rooms.broadcast(
                &RoomId::Conversation(conversation_id.clone()),
                &ServerEvent::UserTyping {
                    conversation_id,
                    user_id: session.user.clone(),
                    is_typing,
                },
                Some(&session.id),
            );
        }

        ClientEvent::SetPresence { online } => {
            broadcast_presence(session, state, online, None);
        }

        ClientEvent::MarkRead {
            conversation_id, ..
        } => {
            if let Err(e) = state.delivery.mark_read(&session.user, &conversation_id).await {
                let _ = tx.send(ServerEvent::error(e.code(), e.to_string()));
            }
        }
    }
}

/// Presence is scoped to the conversation rooms the session joined.
fn broadcast_presence(
    session: &Session,
    state: &AppState,
    online: bool,
    last_seen: Option<chrono::DateTime<Utc>>,
) {
    let event = ServerEvent::UserPresence {
        user_id: session.user.clone(),
        online,
        last_seen,
    };
    for room in session.rooms() {
        if matches!(room, RoomId::Conversation(_)) {
            state.rooms.broadcast(room, &event, Some(&session.id));
        }
    }
}

/// Close the session: broadcast offline presence with a last-seen stamp,
/// leave every room, release the registry entries.
fn teardown(session: &mut Session, state: &AppState, reason: CloseReason) {
    session.close(reason);
    broadcast_presence(session, state, false, Some(Utc::now()));
    state.rooms.leave_all(&session.id);

    info!(
        user = %session.user,
        session = %session.id,
        reason = ?reason,
        "session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::test_state;
    use crate::rooms::RoomId;
    use courier_shared::protocol::SendMessageRequest;
    use courier_shared::types::ConversationId;
    use uuid::Uuid;

    fn live_session(state: &AppState, user: &str, token: Option<&str>) -> Session {
        let user = UserId::from(user);
        let mut session = Session::connecting(user.clone());
        session.begin_auth();
        session.authenticated(state.auth.verify(token, &user));
        session
    }

    #[tokio::test]
    async fn heartbeat_event_acks_and_resets_timer() {
        let (_dir, state) = test_state().await;
        let mut session = live_session(&state, "u1", None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_client_event(&mut session, &state, &tx, ClientEvent::Heartbeat).await;
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::HeartbeatAck);
    }

    #[tokio::test]
    async fn ping_gets_correlated_pong() {
        let (_dir, state) = test_state().await;
        let mut session = live_session(&state, "u1", None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_client_event(&mut session, &state, &tx, ClientEvent::Ping { nonce: 42 }).await;
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Pong { nonce: 42 });
    }

    #[tokio::test]
    async fn full_auth_join_requires_membership() {
        let (_dir, state) = test_state().await;
        state.auth.insert("tok-eve", UserId::from("eve"));

        // u1/u2 have a conversation; eve (full auth) may not join it.
        let conversation = state
            .delivery
            .send(
                &UserId::from("u1"),
                SendMessageRequest::plain(UserId::from("u2"), "hi"),
                None,
            )
            .await
            .unwrap()
            .conversation_id;

        let mut session = live_session(&state, "eve", Some("tok-eve"));
        assert_eq!(session.auth_mode(), Some(AuthMode::Full));
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_client_event(
            &mut session,
            &state,
            &tx,
            ClientEvent::JoinConversation {
                conversation_id: conversation.clone(),
            },
        )
        .await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerEvent::Error { code, .. } if code == "forbidden"
        ));
        assert!(!state
            .rooms
            .is_occupied(&RoomId::Conversation(conversation)));
    }

    #[tokio::test]
    async fn minimal_auth_joins_unconditionally_without_read_flush() {
        let (_dir, state) = test_state().await;

        let stored = state
            .delivery
            .send(
                &UserId::from("u1"),
                SendMessageRequest::plain(UserId::from("u2"), "unread"),
                None,
            )
            .await
            .unwrap();

        // No token: minimal mode, even for a non-participant.
        let mut session = live_session(&state, "lurker", None);
        assert_eq!(session.auth_mode(), Some(AuthMode::Minimal));
        let (tx, _rx) = mpsc::unbounded_channel();

        handle_client_event(
            &mut session,
            &state,
            &tx,
            ClientEvent::JoinConversation {
                conversation_id: stored.conversation_id.clone(),
            },
        )
        .await;

        assert!(state
            .rooms
            .is_occupied(&RoomId::Conversation(stored.conversation_id.clone())));

        // The read-receipt side effect was skipped: u2's unread is intact.
        let db = state.delivery.pool().get().unwrap();
        let conversation = db.get_conversation(&stored.conversation_id).unwrap();
        assert_eq!(conversation.unread_for(&UserId::from("u2")), 1);
    }

    #[tokio::test]
    async fn full_auth_join_flushes_read_receipts() {
        let (_dir, state) = test_state().await;
        state.auth.insert("tok-u2", UserId::from("u2"));

        let stored = state
            .delivery
            .send(
                &UserId::from("u1"),
                SendMessageRequest::plain(UserId::from("u2"), "unread"),
                None,
            )
            .await
            .unwrap();

        let mut session = live_session(&state, "u2", Some("tok-u2"));
        let (tx, _rx) = mpsc::unbounded_channel();

        handle_client_event(
            &mut session,
            &state,
            &tx,
            ClientEvent::JoinConversation {
                conversation_id: stored.conversation_id.clone(),
            },
        )
        .await;

        let db = state.delivery.pool().get().unwrap();
        let conversation = db.get_conversation(&stored.conversation_id).unwrap();
        assert_eq!(conversation.unread_for(&UserId::from("u2")), 0);
    }

    #[tokio::test]
    async fn send_event_acks_with_message_sent() {
        let (_dir, state) = test_state().await;
        let mut session = live_session(&state, "u1", None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut req = SendMessageRequest::plain(UserId::from("u2"), "hello");
        req.client_token = Some("tok-abc".into());

        handle_client_event(&mut session, &state, &tx, ClientEvent::SendMessage(req)).await;

        match rx.try_recv().unwrap() {
            ServerEvent::MessageSent { message } => {
                assert_eq!(message.client_token.as_deref(), Some("tok-abc"));
            }
            other => panic!("expected MessageSent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn typing_is_scoped_to_conversation_room() {
        let (_dir, state) = test_state().await;
        let conversation = ConversationId("u1_u2".into());

        // A second session is joined to the conversation room.
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        state.rooms.join(
            RoomId::Conversation(conversation.clone()),
            Uuid::new_v4(),
            peer_tx,
        );

        let mut session = live_session(&state, "u1", None);
        let (tx, _rx) = mpsc::unbounded_channel();
        handle_client_event(
            &mut session,
            &state,
            &tx,
            ClientEvent::Typing {
                conversation_id: conversation.clone(),
                is_typing: true,
            },
        )
        .await;

        match peer_rx.try_recv().unwrap() {
            ServerEvent::UserTyping { user_id, is_typing, .. } => {
                assert_eq!(user_id, UserId::from("u1"));
                assert!(is_typing);
            }
            other => panic!("expected UserTyping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_broadcasts_offline_with_last_seen() {
        // A session joined to a conversation goes silent; teardown
        // publishes offline presence with a timestamp.
        let (_dir, state) = test_state().await;
        let conversation = ConversationId("u1_u2".into());

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        state.rooms.join(
            RoomId::Conversation(conversation.clone()),
            Uuid::new_v4(),
            peer_tx,
        );

        let mut session = live_session(&state, "u1", None);
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .rooms
            .join(RoomId::Conversation(conversation.clone()), session.id, tx);
        session.joined_room(RoomId::Conversation(conversation));

        teardown(&mut session, &state, CloseReason::HeartbeatTimeout);

        match peer_rx.try_recv().unwrap() {
            ServerEvent::UserPresence {
                user_id,
                online,
                last_seen,
            } => {
                assert_eq!(user_id, UserId::from("u1"));
                assert!(!online);
                assert!(last_seen.is_some());
            }
            other => panic!("expected UserPresence, got {other:?}"),
        }
        assert_eq!(
            session.state(),
            crate::session::SessionState::Closed(CloseReason::HeartbeatTimeout)
        );
    }
}
