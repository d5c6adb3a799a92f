//! Chats API Handlers
//! /api/chats エンドポイント - 1対1会話とメッセージ
//!
//! 会話は参加者ペアごとに高々1つ。pair_key（ソート済みペア）の UNIQUE
//! 制約と INSERT OR IGNORE で、(A,B) と (B,A) の同時開始も同じ行に収束する。

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::error::ApiError;
use crate::models::{
    pair_key, Conversation, ConversationResponse, Message, MessageResponse, PostMessageRequest,
    StartChatRequest, User,
};
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct ChatListResponse {
    pub success: bool,
    pub chats: Vec<ConversationResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct ChatDetailResponse {
    pub success: bool,
    pub chat: ConversationResponse,
}

#[derive(Serialize)]
pub struct MessageListResponse {
    pub success: bool,
    pub messages: Vec<MessageResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct MessageDetailResponse {
    pub success: bool,
    pub message: MessageResponse,
}

// ========================================
// Handlers
// ========================================

/// POST /api/chats - 会話の取得または作成（getOrCreate）
pub async fn start_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartChatRequest>,
) -> Result<Json<ChatDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    let peer_id = req.peer_id.trim();

    if peer_id == caller.user_id() {
        return Err(ApiError::Validation(
            "Cannot start a chat with yourself".to_string(),
        ));
    }

    let peer: Option<User> = sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
        .bind(peer_id)
        .fetch_optional(&state.db)
        .await?;
    let peer = peer.ok_or_else(|| ApiError::NotFound(format!("User not found: {}", peer_id)))?;

    let key = pair_key(caller.user_id(), peer_id);
    let now_ms = chrono::Utc::now().timestamp_millis();

    // 既存行があれば IGNORE され、再選択で必ず同じ行に到達する
    sqlx::query(r#"
        INSERT OR IGNORE INTO conversations (conversation_id, pair_key, user_a, user_b, created_at_ms)
        VALUES (?, ?, ?, ?, ?)
    "#)
    .bind(generate_conversation_id())
    .bind(&key)
    .bind(caller.user_id())
    .bind(peer_id)
    .bind(now_ms)
    .execute(&state.db)
    .await?;

    let conversation: Conversation =
        sqlx::query_as("SELECT * FROM conversations WHERE pair_key = ?")
            .bind(&key)
            .fetch_one(&state.db)
            .await?;

    info!(
        "Chat opened: conversation_id={}, pair_key={}",
        conversation.conversation_id, key
    );

    Ok(Json(ChatDetailResponse {
        success: true,
        chat: ConversationResponse {
            conversation_id: conversation.conversation_id,
            peer_id: peer.user_id,
            peer_name: peer.name,
            created_at_ms: conversation.created_at_ms,
        },
    }))
}

/// GET /api/chats - 自分が参加する会話一覧
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ChatListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let conversations: Vec<Conversation> = sqlx::query_as(
        "SELECT * FROM conversations WHERE user_a = ? OR user_b = ? ORDER BY created_at_ms DESC",
    )
    .bind(caller.user_id())
    .bind(caller.user_id())
    .fetch_all(&state.db)
    .await?;

    // 相手の表示名を解決（退会済みは Unknown 表示）
    let mut chats = Vec::with_capacity(conversations.len());
    for conv in &conversations {
        let peer_id = conv.peer_of(caller.user_id());
        let peer_name: Option<(String,)> =
            sqlx::query_as("SELECT name FROM users WHERE user_id = ?")
                .bind(peer_id)
                .fetch_optional(&state.db)
                .await?;
        chats.push(ConversationResponse {
            conversation_id: conv.conversation_id.clone(),
            peer_id: peer_id.to_string(),
            peer_name: peer_name.map(|(n,)| n).unwrap_or_else(|| "Unknown".to_string()),
            created_at_ms: conv.created_at_ms,
        });
    }

    let total = chats.len();
    Ok(Json(ChatListResponse {
        success: true,
        chats,
        total,
    }))
}

/// POST /api/chats/:conversation_id/messages - メッセージ送信（参加者のみ）
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<MessageDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    let conversation = fetch_conversation(&state, &conversation_id).await?;

    if !conversation.has_participant(caller.user_id()) {
        return Err(ApiError::Forbidden(
            "Only participants may post to this chat".to_string(),
        ));
    }

    let text = req.text.trim();
    if text.is_empty() {
        return Err(ApiError::Validation(
            "Message text must not be empty".to_string(),
        ));
    }

    let message_id = Uuid::new_v4().to_string();
    let now_ms = chrono::Utc::now().timestamp_millis();

    sqlx::query(r#"
        INSERT INTO messages (message_id, conversation_id, sender_id, sender_name, text, sent_at_ms)
        VALUES (?, ?, ?, ?, ?, ?)
    "#)
    .bind(&message_id)
    .bind(&conversation_id)
    .bind(caller.user_id())
    .bind(&caller.user.name)
    .bind(text)
    .bind(now_ms)
    .execute(&state.db)
    .await?;

    let message: Message = sqlx::query_as("SELECT * FROM messages WHERE message_id = ?")
        .bind(&message_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(MessageDetailResponse {
        success: true,
        message: MessageResponse::from_message(&message),
    }))
}

/// GET /api/chats/:conversation_id/messages - メッセージ一覧（参加者のみ）
///
/// sent_at_ms が同値のときは seq（挿入順）で順序を固定する。
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<MessageListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    let conversation = fetch_conversation(&state, &conversation_id).await?;

    if !conversation.has_participant(caller.user_id()) {
        return Err(ApiError::Forbidden(
            "Only participants may read this chat".to_string(),
        ));
    }

    let messages: Vec<Message> = sqlx::query_as(
        "SELECT * FROM messages WHERE conversation_id = ? ORDER BY sent_at_ms ASC, seq ASC",
    )
    .bind(&conversation_id)
    .fetch_all(&state.db)
    .await?;

    let responses: Vec<MessageResponse> =
        messages.iter().map(MessageResponse::from_message).collect();
    let total = responses.len();

    Ok(Json(MessageListResponse {
        success: true,
        messages: responses,
        total,
    }))
}

// ========================================
// Helper Functions
// ========================================

fn generate_conversation_id() -> String {
    let random_bytes: [u8; 5] = rand::thread_rng().gen();
    let encoded = base32::encode(base32::Alphabet::Crockford, &random_bytes);
    format!("CHAT_{}", &encoded[..8])
}

async fn fetch_conversation(
    state: &AppState,
    conversation_id: &str,
) -> Result<Conversation, ApiError> {
    let conversation: Option<Conversation> =
        sqlx::query_as("SELECT * FROM conversations WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&state.db)
            .await?;
    conversation
        .ok_or_else(|| ApiError::NotFound(format!("Conversation not found: {}", conversation_id)))
}
