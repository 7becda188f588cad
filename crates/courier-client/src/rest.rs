//! Typed client for the server's REST fallback surface.
//!
//! Every delivery operation is reachable here, so the controller can keep
//! the full feature set while polling. Identity travels as the
//! `x-user-id` header plus an optional bearer token, exactly as a live
//! WebSocket session presents it.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use courier_shared::protocol::{ConversationPayload, MessagePayload, SendMessageRequest};
use courier_shared::types::{ConversationId, MessageId, UserId};

use crate::ClientError;

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    user_id: UserId,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub total: u32,
    pub conversations: Vec<UnreadEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadEntry {
    pub conversation_id: ConversationId,
    pub unread: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadOutcome {
    pub newly_read: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub user_id: UserId,
    /// Base64-encoded public key material.
    pub public_key: String,
    pub fingerprint: String,
    pub last_rotated: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerRequest<'a> {
    peer_id: &'a UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyRequest<'a> {
    public_key: &'a str,
}

#[derive(Deserialize)]
struct FingerprintResponse {
    fingerprint: String,
}

#[derive(Serialize)]
struct FingerprintRequest<'a> {
    fingerprint: &'a str,
}

#[derive(Deserialize)]
struct ValidResponse {
    valid: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, user_id: UserId, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id,
            token,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("x-user-id", self.user_id.as_str());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Cheap reachability check against the server's health route.
    pub async fn health(&self) -> Result<(), ClientError> {
        let resp = self.request(Method::GET, "/health").send().await?;
        decode::<serde_json::Value>(resp).await.map(|_| ())
    }

    pub async fn find_or_create_conversation(
        &self,
        peer: &UserId,
    ) -> Result<ConversationPayload, ClientError> {
        let resp = self
            .request(Method::POST, "/conversations")
            .json(&PeerRequest { peer_id: peer })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationPayload>, ClientError> {
        let resp = self.request(Method::GET, "/conversations").send().await?;
        decode(resp).await
    }

    pub async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
        let resp = self
            .request(Method::GET, "/conversations/unread")
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn mark_read(
        &self,
        conversation: &ConversationId,
    ) -> Result<MarkReadOutcome, ClientError> {
        let resp = self
            .request(Method::POST, &format!("/conversations/{conversation}/read"))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn delete_conversation(
        &self,
        conversation: &ConversationId,
    ) -> Result<(), ClientError> {
        let resp = self
            .request(Method::DELETE, &format!("/conversations/{conversation}"))
            .send()
            .await?;
        decode::<serde_json::Value>(resp).await.map(|_| ())
    }

    pub async fn send_message(
        &self,
        req: &SendMessageRequest,
    ) -> Result<MessagePayload, ClientError> {
        let resp = self
            .request(Method::POST, "/messages")
            .json(req)
            .send()
            .await?;
        decode(resp).await
    }

    /// Paginated history with a peer, newest first. Also the polling
    /// discovery path: the server stamps the returned messages delivered.
    pub async fn list_messages(
        &self,
        peer: &UserId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let mut req = self.request(Method::GET, &format!("/messages/with/{peer}"));
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        if let Some(offset) = offset {
            req = req.query(&[("offset", offset)]);
        }
        decode(req.send().await?).await
    }

    pub async fn get_message(&self, id: &MessageId) -> Result<MessagePayload, ClientError> {
        let resp = self
            .request(Method::GET, &format!("/messages/{id}"))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn edit_message(
        &self,
        id: &MessageId,
        new_content: &str,
    ) -> Result<MessagePayload, ClientError> {
        let resp = self
            .request(Method::PATCH, &format!("/messages/{id}"))
            .json(&serde_json::json!({ "content": new_content }))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<(), ClientError> {
        let resp = self
            .request(Method::DELETE, &format!("/messages/{id}"))
            .send()
            .await?;
        decode::<serde_json::Value>(resp).await.map(|_| ())
    }

    pub async fn register_key(&self, public_key_b64: &str) -> Result<String, ClientError> {
        let resp = self
            .request(Method::POST, "/keys")
            .json(&PublicKeyRequest {
                public_key: public_key_b64,
            })
            .send()
            .await?;
        decode::<FingerprintResponse>(resp).await.map(|r| r.fingerprint)
    }

    pub async fn rotate_key(&self, public_key_b64: &str) -> Result<String, ClientError> {
        let resp = self
            .request(Method::POST, "/keys/rotate")
            .json(&PublicKeyRequest {
                public_key: public_key_b64,
            })
            .send()
            .await?;
        decode::<FingerprintResponse>(resp).await.map(|r| r.fingerprint)
    }

    pub async fn get_key(&self, user: &UserId) -> Result<KeyInfo, ClientError> {
        let resp = self
            .request(Method::GET, &format!("/keys/{user}"))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn verify_fingerprint(
        &self,
        user: &UserId,
        fingerprint: &str,
    ) -> Result<bool, ClientError> {
        let resp = self
            .request(Method::POST, &format!("/keys/{user}/verify"))
            .json(&FingerprintRequest { fingerprint })
            .send()
            .await?;
        decode::<ValidResponse>(resp).await.map(|r| r.valid)
    }
}

/// Decode a 2xx body, or surface the server's structured error.
async fn decode<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    match resp.json::<ErrorBody>().await {
        Ok(body) => {
            debug!(status = %status, code = %body.code, "server error response");
            Err(ClientError::Server {
                code: body.code,
                message: body.error,
            })
        }
        Err(_) => Err(ClientError::Server {
            code: status_code_label(status).to_string(),
            message: format!("HTTP {status}"),
        }),
    }
}

fn status_code_label(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "validation",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::PAYLOAD_TOO_LARGE => "file_too_large",
        _ => "internal",
    }
}
