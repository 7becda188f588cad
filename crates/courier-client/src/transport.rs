//! Live WebSocket transport.
//!
//! Thin wrapper over tokio-tungstenite that speaks the JSON event
//! protocol: client events out, server events in. Connection lifecycle
//! (retry, fallback, heartbeat cadence) belongs to the controller.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use courier_shared::protocol::{ClientEvent, ServerEvent};
use courier_shared::types::UserId;

use crate::ClientError;

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Establish a live session. `base_url` is the ws(s) endpoint root,
    /// e.g. `ws://host:8080`.
    pub async fn connect(
        base_url: &str,
        user_id: &UserId,
        token: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Self, ClientError> {
        let url = connect_url(base_url, user_id, token, display_name);
        let (stream, _) = connect_async(url.as_str()).await?;
        debug!(user = %user_id, "live transport established");
        Ok(Self { stream })
    }

    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), ClientError> {
        let text = serde_json::to_string(event)?;
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Next server event; `Ok(None)` means the connection closed cleanly.
    /// Non-text frames are skipped.
    pub async fn next(&mut self) -> Result<Option<ServerEvent>, ClientError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Upgrade URL with the identity query parameters the server expects.
/// Values are form-encoded; display names in particular carry spaces and
/// punctuation.
fn connect_url(
    base_url: &str,
    user_id: &UserId,
    token: Option<&str>,
    display_name: Option<&str>,
) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("user_id", user_id.as_str());
    if let Some(token) = token {
        query.append_pair("token", token);
    }
    if let Some(name) = display_name {
        query.append_pair("display_name", name);
    }
    format!(
        "{}/ws?{}",
        base_url.trim_end_matches('/'),
        query.finish()
    )
}
