//! Auth API Handlers
//! /api/auth エンドポイント - 登録・ログイン・セッション解決

use axum::{extract::State, http::HeaderMap, response::Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::error::ApiError;
use crate::models::{LoginRequest, RegisterRequest, User, UserResponse};
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub token: String,
    pub user: UserResponse,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub success: bool,
    pub user: UserResponse,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub success: bool,
    pub message: String,
}

// ========================================
// Handlers
// ========================================

/// POST /api/auth/register - ユーザー登録
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = req.email.trim().to_lowercase();

    // 必須フィールドチェック
    if email.is_empty()
        || req.password.is_empty()
        || req.name.trim().is_empty()
        || req.phone.trim().is_empty()
        || req.address.trim().is_empty()
    {
        return Err(ApiError::Validation("Please fill all fields".to_string()));
    }
    if !email.contains('@') {
        return Err(ApiError::Validation("Invalid email address".to_string()));
    }
    if req.password.len() < 6 {
        return Err(ApiError::Validation(
            "Password must be at least 6 characters".to_string(),
        ));
    }

    let user_id = Uuid::new_v4().to_string();
    let now_ms = chrono::Utc::now().timestamp_millis();
    let password_hash = auth::hash_password(&req.password)?;

    // 重複判定は UNIQUE(email) に任せる。事前 SELECT では同時登録の
    // レースをすり抜けるため、制約違反を Validation に写像する。
    sqlx::query(r#"
        INSERT INTO users (user_id, email, password_hash, name, phone, address, is_seller, created_at_ms)
        VALUES (?, ?, ?, ?, ?, ?, 0, ?)
    "#)
    .bind(&user_id)
    .bind(&email)
    .bind(&password_hash)
    .bind(req.name.trim())
    .bind(req.phone.trim())
    .bind(req.address.trim())
    .bind(now_ms)
    .execute(&state.db)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ApiError::Validation(format!("Email already registered: {}", email))
        }
        _ => ApiError::from(e),
    })?;

    info!("User registered: user_id={}, email={}", user_id, email);

    let user: User = sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
        .bind(&user_id)
        .fetch_one(&state.db)
        .await?;

    let token = auth::issue_session(&state.db, &user_id).await?;
    let role = auth::derive_role(&user, &state.admin_email);

    Ok(Json(AuthResponse {
        success: true,
        token,
        user: UserResponse::from_user(&user, role),
    }))
}

/// POST /api/auth/login - ログイン
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = req.email.trim().to_lowercase();

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?;

    // 未登録とパスワード不一致は区別しない
    let user = user
        .ok_or_else(|| ApiError::Unauthenticated("Invalid email or password".to_string()))?;

    if !auth::verify_password(&req.password, &user.password_hash)? {
        return Err(ApiError::Unauthenticated(
            "Invalid email or password".to_string(),
        ));
    }

    let token = auth::issue_session(&state.db, &user.user_id).await?;
    let role = auth::derive_role(&user, &state.admin_email);

    info!("User logged in: user_id={}", user.user_id);

    Ok(Json(AuthResponse {
        success: true,
        token,
        user: UserResponse::from_user(&user, role),
    }))
}

/// POST /api/auth/logout - 提示セッションの失効
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, ApiError> {
    let token = auth::bearer_token(&headers)?;
    auth::revoke_session(&state.db, token).await?;

    Ok(Json(LogoutResponse {
        success: true,
        message: "Logged out".to_string(),
    }))
}

/// GET /api/auth/me - セッション解決（Identity + 導出ロール）
pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    Ok(Json(MeResponse {
        success: true,
        user: UserResponse::from_user(&caller.user, caller.role),
    }))
}
