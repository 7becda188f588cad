//! Reconnection controller.
//!
//! Owns the transport lifecycle on behalf of the consumer: establish the
//! live WebSocket, keep it alive with heartbeats, reconnect with
//! exponential backoff when it drops, and fall back to REST polling once
//! the attempt budget is spent. While polling, each cycle re-probes the
//! live transport and resumes it as soon as it comes back.
//!
//! Sends issued while disconnected are queued and flushed in order on
//! the next working transport; the consumer is told about degraded /
//! restored transitions so it can surface connection state.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_shared::constants::{
    HEARTBEAT_ACK_WINDOW_SECS, HEARTBEAT_INTERVAL_SECS, POLL_INTERVAL_SECS,
};
use courier_shared::protocol::{ClientEvent, MessagePayload, SendMessageRequest, ServerEvent};
use courier_shared::types::{ConversationId, UserId};

use crate::backoff::Backoff;
use crate::inbox::Inbox;
use crate::rest::RestClient;
use crate::transport::WsTransport;

// ---------------------------------------------------------------------------
// Reconnect policy (pure state machine)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Live WebSocket established.
    Live,
    /// Between attempts, still inside the backoff budget.
    Reconnecting,
    /// Budget exhausted; REST polling with periodic re-probes.
    Polling,
}

/// What the driver should do after a connectivity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Wait this long, then attempt the live transport again.
    RetryAfter(Duration),
    /// Stop retrying; switch to polling.
    FallBackToPolling,
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    state: TransportState,
    backoff: Backoff,
}

impl ReconnectPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: TransportState::Reconnecting,
            backoff,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// The live transport is up; the attempt budget refills.
    pub fn on_connected(&mut self) {
        self.state = TransportState::Live;
        self.backoff.reset();
    }

    /// The live transport failed (to connect, or mid-session).
    pub fn on_connection_lost(&mut self) -> PolicyAction {
        match self.backoff.next_delay() {
            Some(delay) => {
                self.state = TransportState::Reconnecting;
                PolicyAction::RetryAfter(delay)
            }
            None => {
                self.state = TransportState::Polling;
                PolicyAction::FallBackToPolling
            }
        }
    }

    /// A polling-mode probe reached the server; worth attempting the live
    /// transport again with a fresh budget.
    pub fn on_probe_success(&mut self) {
        self.backoff.reset();
        self.state = TransportState::Reconnecting;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

// ---------------------------------------------------------------------------
// Consumer-facing types
// ---------------------------------------------------------------------------

/// Operations the consumer can issue regardless of transport state.
#[derive(Debug, Clone)]
pub enum Command {
    Send(SendMessageRequest),
    MarkRead(ConversationId),
    JoinConversation(ConversationId),
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    SetPresence {
        online: bool,
    },
}

/// Everything the controller surfaces to the consumer.
#[derive(Debug, Clone)]
pub enum Notification {
    /// An incoming message, already deduplicated.
    Message(MessagePayload),
    /// Our own send was accepted and stored.
    MessageAcked(MessagePayload),
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        read_at: chrono::DateTime<chrono::Utc>,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    Presence {
        user_id: UserId,
        online: bool,
        last_seen: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Live transport gone; operating in polling mode.
    TransportDegraded,
    /// Live transport re-established.
    TransportRestored,
    /// The server rejected an operation.
    ServerError { code: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// WebSocket endpoint root, e.g. `ws://host:8080`.
    pub ws_url: String,
    pub token: Option<String>,
    pub display_name: Option<String>,
    pub heartbeat_interval: Duration,
    /// How long after a heartbeat an ack may take before the connection
    /// is declared dead.
    pub ack_window: Duration,
    pub poll_interval: Duration,
}

impl ControllerConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: None,
            display_name: None,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            ack_window: Duration::from_secs(HEARTBEAT_ACK_WINDOW_SECS),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller driver
// ---------------------------------------------------------------------------

pub struct Controller {
    config: ControllerConfig,
    rest: RestClient,
    policy: ReconnectPolicy,
    inbox: Inbox,
    /// Sends issued while no transport was usable, flushed in order.
    pending: VecDeque<SendMessageRequest>,
}

enum LiveExit {
    ConnectionLost,
    CommandsClosed,
}

impl Controller {
    pub fn new(config: ControllerConfig, rest: RestClient) -> Self {
        Self {
            config,
            rest,
            policy: ReconnectPolicy::default(),
            inbox: Inbox::new(),
            pending: VecDeque::new(),
        }
    }

    /// Run until the command channel closes. Notifications flow out as
    /// they happen; commands are accepted in every transport state.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        notifications: mpsc::Sender<Notification>,
    ) {
        let mut was_degraded = false;
        // A socket handed back by a successful polling-mode probe; used
        // directly instead of connecting again.
        let mut next_ws: Option<WsTransport> = None;

        loop {
            let connected = match next_ws.take() {
                Some(ws) => Ok(ws),
                None => {
                    WsTransport::connect(
                        &self.config.ws_url,
                        self.rest.user_id(),
                        self.config.token.as_deref(),
                        self.config.display_name.as_deref(),
                    )
                    .await
                }
            };

            match connected {
                Ok(mut ws) => {
                    self.policy.on_connected();
                    if was_degraded {
                        was_degraded = false;
                        let _ = notifications.send(Notification::TransportRestored).await;
                    }

                    if self.flush_pending_live(&mut ws).await.is_ok() {
                        match self.run_live(&mut ws, &mut commands, &notifications).await {
                            LiveExit::CommandsClosed => {
                                ws.close().await;
                                return;
                            }
                            LiveExit::ConnectionLost => {}
                        }
                    }
                    info!("live transport lost");
                }
                Err(e) => {
                    debug!(error = %e, "live transport connect failed");
                }
            }

            match self.policy.on_connection_lost() {
                PolicyAction::RetryAfter(delay) => {
                    debug!(?delay, "retrying live transport");
                    if !self.wait_and_serve(delay, &mut commands, &notifications).await {
                        return; // commands closed
                    }
                }
                PolicyAction::FallBackToPolling => {
                    warn!("reconnect budget exhausted, falling back to polling");
                    if !was_degraded {
                        was_degraded = true;
                        let _ = notifications.send(Notification::TransportDegraded).await;
                    }
                    match self.run_polling(&mut commands, &notifications).await {
                        Some(ws) => next_ws = Some(ws),
                        None => return, // commands closed
                    }
                }
            }
        }
    }

    /// Sit out a backoff delay without going deaf: commands issued while
    /// waiting are served over REST. Returns `false` when the command
    /// channel closed.
    async fn wait_and_serve(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::Receiver<Command>,
        notifications: &mpsc::Sender<Notification>,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            self.handle_command_polling(command, notifications).await;
                        }
                        None => return false,
                    }
                }
            }
        }
    }

    /// Drive the live session until it drops.
    async fn run_live(
        &mut self,
        ws: &mut WsTransport,
        commands: &mut mpsc::Receiver<Command>,
        notifications: &mpsc::Sender<Notification>,
    ) -> LiveExit {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately
        let mut ack_deadline: Option<Instant> = None;

        loop {
            let ack_timeout = async {
                match ack_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                incoming = ws.next() => {
                    match incoming {
                        Ok(Some(event)) => {
                            if matches!(event, ServerEvent::HeartbeatAck) {
                                ack_deadline = None;
                            }
                            self.dispatch_server_event(event, notifications).await;
                        }
                        Ok(None) | Err(_) => return LiveExit::ConnectionLost,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command_live(ws, command).await.is_err() {
                                return LiveExit::ConnectionLost;
                            }
                        }
                        None => return LiveExit::CommandsClosed,
                    }
                }
                _ = heartbeat.tick() => {
                    if ws.send(&ClientEvent::Heartbeat).await.is_err() {
                        return LiveExit::ConnectionLost;
                    }
                    if ack_deadline.is_none() {
                        ack_deadline = Some(Instant::now() + self.config.ack_window);
                    }
                }
                _ = ack_timeout => {
                    warn!("heartbeat ack overdue, declaring connection dead");
                    return LiveExit::ConnectionLost;
                }
            }
        }
    }

    async fn dispatch_server_event(
        &mut self,
        event: ServerEvent,
        notifications: &mpsc::Sender<Notification>,
    ) {
        let notification = match event {
            ServerEvent::NewMessage { message, .. } => {
                match self.inbox.accept(message) {
                    Some(message) => Notification::Message(message),
                    None => return, // duplicate
                }
            }
            ServerEvent::MessageSent { message } => {
                self.forget_pending(&message);
                Notification::MessageAcked(message)
            }
            ServerEvent::MessagesRead {
                conversation_id,
                reader_id,
                read_at,
            } => Notification::MessagesRead {
                conversation_id,
                reader_id,
                read_at,
            },
            ServerEvent::UserTyping {
                conversation_id,
                user_id,
                is_typing,
            } => Notification::Typing {
                conversation_id,
                user_id,
                is_typing,
            },
            ServerEvent::UserPresence {
                user_id,
                online,
                last_seen,
            } => Notification::Presence {
                user_id,
                online,
                last_seen,
            },
            ServerEvent::Error { code, message } => Notification::ServerError { code, message },
            ServerEvent::HeartbeatAck | ServerEvent::Pong { .. } => return,
        };
        let _ = notifications.send(notification).await;
    }

    async fn handle_command_live(
        &mut self,
        ws: &mut WsTransport,
        command: Command,
    ) -> Result<(), crate::ClientError> {
        match command {
            Command::Send(req) => {
                let req = with_client_token(req);
                // Queue first: if the socket dies mid-send the message is
                // retried on the next transport, deduplicated by token.
                self.pending.push_back(req.clone());
                ws.send(&ClientEvent::SendMessage(req)).await
            }
            Command::MarkRead(conversation_id) => {
                ws.send(&ClientEvent::MarkRead {
                    conversation_id,
                    sender_id: None,
                })
                .await
            }
            Command::JoinConversation(conversation_id) => {
                ws.send(&ClientEvent::JoinConversation { conversation_id }).await
            }
            Command::Typing {
                conversation_id,
                is_typing,
            } => {
                ws.send(&ClientEvent::Typing {
                    conversation_id,
                    is_typing,
                })
                .await
            }
            Command::SetPresence { online } => {
                ws.send(&ClientEvent::SetPresence { online }).await
            }
        }
    }

    /// Replay queued sends over a fresh live connection, oldest first.
    async fn flush_pending_live(&mut self, ws: &mut WsTransport) -> Result<(), crate::ClientError> {
        for req in self.pending.clone() {
            ws.send(&ClientEvent::SendMessage(req)).await?;
        }
        Ok(())
    }

    /// An acked send no longer needs replaying.
    fn forget_pending(&mut self, acked: &MessagePayload) {
        if let Some(token) = &acked.client_token {
            self.pending
                .retain(|req| req.client_token.as_ref() != Some(token));
        }
    }

    /// Polling loop: flush queued sends over REST, discover new messages
    /// through the unread summary, serve commands, and probe the live
    /// transport each cycle. The probe is a real WebSocket connect, not a
    /// REST health check; an HTTP-reachable server whose socket path is
    /// still down must not bounce us out of polling. Returns the freshly
    /// connected socket when a probe succeeds, `None` when the command
    /// channel closed.
    async fn run_polling(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        notifications: &mpsc::Sender<Notification>,
    ) -> Option<WsTransport> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_pending_rest(notifications).await;
                    self.poll_once(notifications).await;

                    match WsTransport::connect(
                        &self.config.ws_url,
                        self.rest.user_id(),
                        self.config.token.as_deref(),
                        self.config.display_name.as_deref(),
                    )
                    .await
                    {
                        Ok(ws) => {
                            self.policy.on_probe_success();
                            return Some(ws);
                        }
                        Err(e) => debug!(error = %e, "live transport probe failed"),
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command_polling(command, notifications).await,
                        None => return None,
                    }
                }
            }
        }
    }

    async fn handle_command_polling(
        &mut self,
        command: Command,
        notifications: &mpsc::Sender<Notification>,
    ) {
        match command {
            Command::Send(req) => {
                let req = with_client_token(req);
                match self.rest.send_message(&req).await {
                    Ok(stored) => {
                        let _ = notifications.send(Notification::MessageAcked(stored)).await;
                    }
                    Err(crate::ClientError::Server { code, message }) => {
                        // Rejected outright; retrying an invalid request
                        // cannot succeed.
                        let _ = notifications
                            .send(Notification::ServerError { code, message })
                            .await;
                    }
                    Err(e) => {
                        debug!(error = %e, "send over REST failed, queueing for retry");
                        self.pending.push_back(req);
                    }
                }
            }
            Command::MarkRead(conversation_id) => {
                if let Err(e) = self.rest.mark_read(&conversation_id).await {
                    debug!(error = %e, "mark read over REST failed");
                }
            }
            // Room membership and ephemeral signals only exist on the
            // live transport.
            Command::JoinConversation(_) | Command::Typing { .. } | Command::SetPresence { .. } => {}
        }
    }

    /// Replay queued sends over REST, stopping at the first transport
    /// failure so order is preserved.
    async fn flush_pending_rest(&mut self, notifications: &mpsc::Sender<Notification>) {
        while let Some(req) = self.pending.front().cloned() {
            match self.rest.send_message(&req).await {
                Ok(stored) => {
                    self.pending.pop_front();
                    let _ = notifications.send(Notification::MessageAcked(stored)).await;
                }
                Err(crate::ClientError::Server { code, message }) => {
                    self.pending.pop_front();
                    let _ = notifications
                        .send(Notification::ServerError { code, message })
                        .await;
                }
                Err(e) => {
                    debug!(error = %e, "pending flush interrupted");
                    break;
                }
            }
        }
    }

    /// One discovery pass: fetch the unread summary, then pull history
    /// for each conversation with pending messages. Listing stamps
    /// delivery server-side; the inbox drops anything already seen.
    async fn poll_once(&mut self, notifications: &mpsc::Sender<Notification>) {
        let summary = match self.rest.unread_summary().await {
            Ok(summary) => summary,
            Err(e) => {
                debug!(error = %e, "poll cycle failed");
                return;
            }
        };
        if summary.total == 0 {
            return;
        }

        let conversations = match self.rest.list_conversations().await {
            Ok(conversations) => conversations,
            Err(e) => {
                debug!(error = %e, "conversation listing failed");
                return;
            }
        };

        for entry in &summary.conversations {
            let Some(peer) = conversations
                .iter()
                .find(|c| c.id == entry.conversation_id)
                .and_then(|c| {
                    c.participants
                        .iter()
                        .find(|p| *p != self.rest.user_id())
                        .cloned()
                })
            else {
                continue;
            };

            match self.rest.list_messages(&peer, Some(entry.unread), None).await {
                Ok(messages) => {
                    // Newest first on the wire; surface oldest first.
                    for message in messages.into_iter().rev() {
                        if message.sender_id == *self.rest.user_id() {
                            continue;
                        }
                        if let Some(message) = self.inbox.accept(message) {
                            let _ = notifications.send(Notification::Message(message)).await;
                        }
                    }
                }
                Err(e) => debug!(error = %e, peer = %peer, "message poll failed"),
            }
        }
    }
}

/// Every send carries a client token so retries across transports can be
/// reconciled by the receiving inbox and the ack path.
fn with_client_token(mut req: SendMessageRequest) -> SendMessageRequest {
    if req.client_token.is_none() {
        req.client_token = Some(uuid::Uuid::new_v4().to_string());
    }
    req
}
