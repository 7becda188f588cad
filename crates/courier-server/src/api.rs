//! REST fallback surface.
//!
//! Every delivery operation reachable over the live transport is also
//! reachable here, so a client whose WebSocket cannot be established (or
//! whose reconnection controller has dropped to polling) keeps full
//! functionality minus push latency. Handlers delegate to the same
//! [`DeliveryCoordinator`] as the live transport; the two paths share
//! validation, persistence, and fan-out.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, Method},
    routing::{delete, get, patch, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use courier_shared::envelope::MessageBody;
use courier_shared::protocol::{ConversationPayload, MessagePayload, SendMessageRequest};
use courier_shared::sanitize::sanitize_text;
use courier_shared::types::{ConversationId, MessageId, MessageKind, UserId};
use courier_store::StoreError;

use crate::auth::{AuthMode, ProfileDirectory, SessionTokens};
use crate::config::ServerConfig;
use crate::delivery::DeliveryCoordinator;
use crate::error::ServerError;
use crate::files::FileStore;
use crate::rooms::RoomRegistry;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub delivery: Arc<DeliveryCoordinator>,
    pub auth: SessionTokens,
    pub profiles: ProfileDirectory,
    pub rooms: RoomRegistry,
    pub files: Arc<FileStore>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let body_limit = state.config.max_file_size + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/conversations", post(create_conversation))
        .route("/conversations", get(list_conversations))
        .route("/conversations/unread", get(unread_summary))
        .route("/conversations/:id", get(get_conversation))
        .route("/conversations/:id", delete(delete_conversation))
        .route("/conversations/:id/read", post(mark_conversation_read))
        .route("/messages", post(send_message))
        .route("/messages/file", post(send_file_message))
        .route("/messages/with/:peer", get(list_messages))
        .route("/messages/:id", get(get_message))
        .route("/messages/:id", patch(edit_message))
        .route("/messages/:id", delete(delete_message))
        .route("/files/:name", get(download_file))
        .route("/keys", post(register_key))
        .route("/keys/rotate", post(rotate_key))
        .route("/keys/:user_id", get(get_key))
        .route("/keys/:user_id/verify", post(verify_fingerprint))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and run the HTTP server (REST fallback + WebSocket upgrade).
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Resolve the caller from request headers.
///
/// Identity is the `x-user-id` header; a bearer token, when present and
/// matching, upgrades the call to full auth. As on the live transport, a
/// bad token degrades to minimal mode rather than rejecting, but a call
/// with no claimed identity at all cannot be served.
fn caller(state: &AppState, headers: &HeaderMap) -> Result<(UserId, AuthMode), ServerError> {
    let user = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(UserId::from)
        .ok_or_else(|| ServerError::Unauthorized("x-user-id header is required".into()))?;

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let mode = state.auth.verify(token, &user);
    if mode == AuthMode::Minimal {
        debug!(user = %user, "REST call in minimal-auth mode");
    }
    Ok((user, mode))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    peer_id: UserId,
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ConversationPayload>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let payload = state
        .delivery
        .with_store(move |db| {
            let conversation = db.find_or_create_conversation(&user, &req.peer_id)?;
            Ok(conversation.payload_for(&user))
        })
        .await?;
    Ok(Json(payload))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationPayload>>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let payloads = state
        .delivery
        .with_store(move |db| {
            let conversations = db.list_conversations_for_user(&user)?;
            Ok(conversations.iter().map(|c| c.payload_for(&user)).collect())
        })
        .await?;
    Ok(Json(payloads))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadSummary {
    total: u32,
    conversations: Vec<UnreadEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadEntry {
    conversation_id: ConversationId,
    unread: u32,
}

/// Aggregate unread total plus a per-conversation breakdown, for badge
/// rendering without fetching message lists.
async fn unread_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UnreadSummary>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let summary = state
        .delivery
        .with_store(move |db| {
            let total = db.total_unread_for_user(&user)?;
            let conversations = db
                .list_conversations_for_user(&user)?
                .into_iter()
                .filter(|c| c.unread_for(&user) > 0)
                .map(|c| UnreadEntry {
                    unread: c.unread_for(&user),
                    conversation_id: c.id,
                })
                .collect();
            Ok(UnreadSummary {
                total,
                conversations,
            })
        })
        .await?;

    Ok(Json(summary))
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ConversationId>,
) -> Result<Json<ConversationPayload>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let payload = state
        .delivery
        .with_store(move |db| {
            let conversation = db.get_conversation(&id)?;
            if !conversation.contains(&user) {
                return Err(StoreError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }
            Ok(conversation.payload_for(&user))
        })
        .await?;
    Ok(Json(payload))
}

/// Soft delete: hides the conversation from the caller's listing without
/// affecting the other participant's view.
async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ConversationId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    state
        .delivery
        .with_store(move |db| {
            let conversation = db.get_conversation(&id)?;
            if !conversation.contains(&user) {
                return Err(StoreError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }
            db.soft_delete_conversation(&id, &user)
        })
        .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    newly_read: u32,
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ConversationId>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let (user, _) = caller(&state, &headers)?;
    let newly_read = state.delivery.mark_read(&user, &id).await?;
    Ok(Json(MarkReadResponse { newly_read }))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, ServerError> {
    let (user, _) = caller(&state, &headers)?;
    let stored = state.delivery.send(&user, req, None).await?;
    Ok(Json(stored.into()))
}

/// Multipart file message: a `receiverId` field, an optional `content`
/// caption, and the `file` part itself. The attachment is validated and
/// persisted first; the message then goes through the normal delivery
/// path with the file metadata attached.
async fn send_file_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<MessagePayload>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let mut receiver_id: Option<UserId> = None;
    let mut caption: Option<String> = None;
    let mut client_token: Option<String> = None;
    let mut upload: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "receiverId" => {
                receiver_id = Some(UserId::new(field.text().await.map_err(bad_field)?));
            }
            "content" => {
                caption = Some(field.text().await.map_err(bad_field)?);
            }
            "clientToken" => {
                client_token = Some(field.text().await.map_err(bad_field)?);
            }
            "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ServerError::Validation("file part needs a filename".into()))?;
                let mime_type = field
                    .content_type()
                    .map(str::to_string)
                    .ok_or_else(|| ServerError::Validation("file part needs a MIME type".into()))?;
                let data = field.bytes().await.map_err(bad_field)?;
                upload = Some((file_name, mime_type, data.to_vec()));
            }
            other => {
                debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let receiver_id =
        receiver_id.ok_or_else(|| ServerError::Validation("receiverId is required".into()))?;
    let (file_name, mime_type, data) =
        upload.ok_or_else(|| ServerError::Validation("file part is required".into()))?;

    let meta = state.files.store(&file_name, &mime_type, &data).await?;

    let kind = if mime_type.starts_with("image/") {
        MessageKind::Image
    } else {
        MessageKind::File
    };

    let req = SendMessageRequest {
        receiver_id,
        encrypted: false,
        content: Some(caption.unwrap_or_else(|| meta.file_name.clone())),
        encrypted_content: None,
        encrypted_key: None,
        iv: None,
        kind,
        file: Some(meta),
        client_token,
    };

    let stored = state.delivery.send(&user, req, None).await?;
    Ok(Json(stored.into()))
}

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<u32>,
    offset: Option<u32>,
}

/// Paginated history with the given peer, newest first. Listing is also
/// the fallback discovery path, so everything the peer sent is stamped
/// delivered as a side effect.
async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(peer): Path<UserId>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<MessagePayload>>, ServerError> {
    let (user, _) = caller(&state, &headers)?;
    let limit = page.limit.unwrap_or(state.config.page_size);
    let offset = page.offset.unwrap_or(0);

    let messages = state
        .delivery
        .with_store(move |db| {
            let messages = db.list_messages_between(&user, &peer, limit, offset)?;
            db.mark_delivered(&user, &peer)?;
            Ok(messages)
        })
        .await?;

    Ok(Json(messages.into_iter().map(Into::into).collect()))
}

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MessageId>,
) -> Result<Json<MessagePayload>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let message = state
        .delivery
        .with_store(move |db| {
            let message = db.get_message(&id)?;
            if message.sender_id != user && message.receiver_id != user {
                return Err(StoreError::Forbidden(
                    "not a participant of this message".into(),
                ));
            }
            Ok(message)
        })
        .await?;
    Ok(Json(message.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditMessageRequest {
    #[serde(default)]
    encrypted: bool,
    content: Option<String>,
    encrypted_content: Option<String>,
    encrypted_key: Option<String>,
    iv: Option<String>,
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MessageId>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessagePayload>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    let new_body = if req.encrypted {
        let missing = |f: &str| ServerError::Validation(format!("{f} is required for this mode"));
        MessageBody::encrypted(
            req.encrypted_content
                .as_deref()
                .ok_or_else(|| missing("encryptedContent"))?,
            req.encrypted_key
                .as_deref()
                .ok_or_else(|| missing("encryptedKey"))?,
            req.iv.as_deref().ok_or_else(|| missing("iv"))?,
        )
        .map_err(|e| ServerError::Validation(e.to_string()))?
    } else {
        let content = req
            .content
            .as_deref()
            .ok_or_else(|| ServerError::Validation("content is required".into()))?;
        MessageBody::plain(sanitize_text(content))
            .map_err(|e| ServerError::Validation(e.to_string()))?
    };

    let updated = state
        .delivery
        .with_store(move |db| db.edit_message(&id, &user, new_body))
        .await?;
    Ok(Json(updated.into()))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MessageId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = caller(&state, &headers)?;

    state
        .delivery
        .with_store(move |db| db.soft_delete_message(&id, &user))
        .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Vec<u8>, ServerError> {
    caller(&state, &headers)?;
    state.files.load(&name).await
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterKeyRequest {
    /// Base64-encoded public key material.
    public_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintResponse {
    fingerprint: String,
}

async fn register_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterKeyRequest>,
) -> Result<Json<FingerprintResponse>, ServerError> {
    let (user, _) = caller(&state, &headers)?;
    let key = decode_key(&req.public_key)?;

    let fingerprint = state
        .delivery
        .with_store(move |db| db.register_key(&user, &key))
        .await?;
    Ok(Json(FingerprintResponse { fingerprint }))
}

async fn rotate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterKeyRequest>,
) -> Result<Json<FingerprintResponse>, ServerError> {
    let (user, _) = caller(&state, &headers)?;
    let key = decode_key(&req.public_key)?;

    let fingerprint = state
        .delivery
        .with_store(move |db| db.rotate_key(&user, &key))
        .await?;
    Ok(Json(FingerprintResponse { fingerprint }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyResponse {
    user_id: UserId,
    public_key: String,
    fingerprint: String,
    last_rotated: chrono::DateTime<chrono::Utc>,
}

async fn get_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
) -> Result<Json<KeyResponse>, ServerError> {
    caller(&state, &headers)?;

    let record = state
        .delivery
        .with_store(move |db| db.get_key(&user_id))
        .await?;
    Ok(Json(KeyResponse {
        user_id: record.user_id,
        public_key: base64::engine::general_purpose::STANDARD.encode(&record.public_key),
        fingerprint: record.fingerprint,
        last_rotated: record.last_rotated,
    }))
}

#[derive(Debug, Deserialize)]
struct VerifyFingerprintRequest {
    fingerprint: String,
}

#[derive(Debug, Serialize)]
struct VerifyFingerprintResponse {
    valid: bool,
}

async fn verify_fingerprint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
    Json(req): Json<VerifyFingerprintRequest>,
) -> Result<Json<VerifyFingerprintResponse>, ServerError> {
    caller(&state, &headers)?;

    let valid = state
        .delivery
        .with_store(move |db| db.verify_fingerprint(&user_id, &req.fingerprint))
        .await?;
    Ok(Json(VerifyFingerprintResponse { valid }))
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, ServerError> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ServerError::Validation("publicKey is not valid base64".into()))
}

fn bad_field(e: axum::extract::multipart::MultipartError) -> ServerError {
    ServerError::Validation(format!("malformed multipart field: {e}"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use courier_store::DatabasePool;

    /// Fully wired state over a throwaway database and file directory.
    pub(crate) async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_at(&dir.path().join("courier.db")).unwrap();

        let rooms = RoomRegistry::new();
        let profiles = ProfileDirectory::new();
        let delivery = Arc::new(DeliveryCoordinator::new(
            pool,
            rooms.clone(),
            profiles.clone(),
        ));
        let files = Arc::new(
            FileStore::new(dir.path().join("files"), 1024 * 1024)
                .await
                .unwrap(),
        );

        let state = AppState {
            delivery,
            auth: SessionTokens::new(),
            profiles,
            rooms,
            files,
            config: Arc::new(ServerConfig::default()),
        };
        (dir, state)
    }
}
