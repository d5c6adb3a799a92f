//! Session Authority
//! Bearer トークン → Identity + 導出ロールの解決と、各操作のゲート

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::HeaderMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::DbPool;
use crate::error::ApiError;
use crate::models::{Role, Session, User};

/// セッション有効期間（30日）
const SESSION_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// 認証済み呼び出し元
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub role: Role,
}

impl AuthUser {
    pub fn user_id(&self) -> &str {
        &self.user.user_id
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ========================================
// Role
// ========================================

/// ロール導出
///
/// admin は予約アドレス一致のみ。それ以外は is_seller の自己申告で
/// buyer/seller を表示上区別する（出品権限の差はない）。
pub fn derive_role(user: &User, admin_email: &str) -> Role {
    if user.email == admin_email {
        Role::Admin
    } else if user.is_seller == 1 {
        Role::Seller
    } else {
        Role::Buyer
    }
}

// ========================================
// Password
// ========================================

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("password hash error: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, ApiError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| ApiError::Internal(format!("stored hash corrupt: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

// ========================================
// Session Tokens
// ========================================

/// 新規トークン生成（32バイト乱数の hex、クライアントに一度だけ返す）
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// DB保存用ダイジェスト
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// セッション発行。生トークンを返す。
pub async fn issue_session(pool: &DbPool, user_id: &str) -> Result<String, ApiError> {
    let token = generate_token();
    let now_ms = chrono::Utc::now().timestamp_millis();

    sqlx::query(
        "INSERT INTO sessions (token_hash, user_id, created_at_ms, expires_at_ms) VALUES (?, ?, ?, ?)"
    )
    .bind(hash_token(&token))
    .bind(user_id)
    .bind(now_ms)
    .bind(now_ms + SESSION_TTL_MS)
    .execute(pool)
    .await?;

    info!("Session issued: user_id={}", user_id);
    Ok(token)
}

/// 提示されたセッションを失効させる
pub async fn revoke_session(pool: &DbPool, token: &str) -> Result<bool, ApiError> {
    let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
        .bind(hash_token(token))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ========================================
// Gates
// ========================================

/// Authorization ヘッダから Bearer トークンを取り出す
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthenticated("Missing authorization header".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthenticated("Malformed authorization header".to_string()))
}

/// resolveSession: トークン → Identity + ロール
///
/// すべての保護エンドポイントが最初に呼ぶ。セッション切れは行を消して 401。
pub async fn require_session(
    pool: &DbPool,
    admin_email: &str,
    headers: &HeaderMap,
) -> Result<AuthUser, ApiError> {
    let token = bearer_token(headers)?;
    let token_hash = hash_token(token);

    let session: Option<Session> = sqlx::query_as("SELECT * FROM sessions WHERE token_hash = ?")
        .bind(&token_hash)
        .fetch_optional(pool)
        .await?;

    let session = session
        .ok_or_else(|| ApiError::Unauthenticated("Invalid session token".to_string()))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    if session.expires_at_ms <= now_ms {
        let _ = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(&token_hash)
            .execute(pool)
            .await;
        return Err(ApiError::Unauthenticated("Session expired".to_string()));
    }

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
        .bind(&session.user_id)
        .fetch_optional(pool)
        .await?;

    let user = user
        .ok_or_else(|| ApiError::Unauthenticated("Session user no longer exists".to_string()))?;

    let role = derive_role(&user, admin_email);
    Ok(AuthUser { user, role })
}

/// requireRole(admin): listing の approve/reject などの管理操作ゲート
pub fn require_admin(caller: &AuthUser) -> Result<(), ApiError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Admin role required".to_string()))
    }
}
