//! Users API Handlers
//! /api/users エンドポイント - プロフィール閲覧・編集、管理者向け一覧

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::auth;
use crate::error::ApiError;
use crate::models::{UpdateUserRequest, User, UserResponse};
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct UserListResponse {
    pub success: bool,
    pub users: Vec<UserResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct UserDetailResponse {
    pub success: bool,
    pub user: UserResponse,
}

// ========================================
// Handlers
// ========================================

/// GET /api/users - 登録ユーザー一覧（admin のみ）
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    auth::require_admin(&caller)?;

    let users: Vec<User> = sqlx::query_as("SELECT * FROM users ORDER BY created_at_ms DESC")
        .fetch_all(&state.db)
        .await?;

    let responses: Vec<UserResponse> = users
        .iter()
        .map(|u| UserResponse::from_user(u, auth::derive_role(u, &state.admin_email)))
        .collect();

    let total = responses.len();
    Ok(Json(UserListResponse {
        success: true,
        users: responses,
        total,
    }))
}

/// GET /api/users/:user_id - プロフィール取得（認証済みなら誰でも）
///
/// チャット相手や出品者の表示名解決に使うため、閲覧は本人に限定しない。
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserDetailResponse>, ApiError> {
    let _caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
        .bind(&user_id)
        .fetch_optional(&state.db)
        .await?;

    let user = user.ok_or_else(|| ApiError::NotFound(format!("User not found: {}", user_id)))?;
    let role = auth::derive_role(&user, &state.admin_email);

    Ok(Json(UserDetailResponse {
        success: true,
        user: UserResponse::from_user(&user, role),
    }))
}

/// PUT /api/users/:user_id - プロフィール更新（本人のみ、部分更新）
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    if caller.user_id() != user_id {
        return Err(ApiError::Forbidden(
            "Profile can only be edited by its owner".to_string(),
        ));
    }

    if let Some(name) = &req.name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("Name must not be empty".to_string()));
        }
    }

    // DB更新（未指定フィールドは現値維持）
    sqlx::query(r#"
        UPDATE users SET
            name = COALESCE(?, name),
            phone = COALESCE(?, phone),
            address = COALESCE(?, address),
            is_seller = COALESCE(?, is_seller)
        WHERE user_id = ?
    "#)
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.phone.as_deref().map(str::trim))
    .bind(req.address.as_deref().map(str::trim))
    .bind(req.is_seller.map(|b| if b { 1 } else { 0 }))
    .bind(&user_id)
    .execute(&state.db)
    .await?;

    info!("User updated: user_id={}", user_id);

    let user: User = sqlx::query_as("SELECT * FROM users WHERE user_id = ?")
        .bind(&user_id)
        .fetch_one(&state.db)
        .await?;
    let role = auth::derive_role(&user, &state.admin_email);

    Ok(Json(UserDetailResponse {
        success: true,
        user: UserResponse::from_user(&user, role),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::test_util::{auth_headers, seed_user, test_state, TEST_ADMIN_EMAIL};

    #[tokio::test]
    async fn owner_can_partially_update_profile() {
        let state = test_state().await;
        let (user_id, token) = seed_user(&state, "edit@example.com", "Before").await;

        let res = update_user(
            State(state.clone()),
            auth_headers(&token),
            Path(user_id.clone()),
            Json(UpdateUserRequest {
                name: Some("After".to_string()),
                phone: None,
                address: None,
                is_seller: Some(true),
            }),
        )
        .await
        .unwrap();

        assert_eq!(res.0.user.name, "After");
        assert!(res.0.user.is_seller);
        assert_eq!(res.0.user.role, Role::Seller);
        // 未指定フィールドは維持
        assert_eq!(res.0.user.phone, "555-0100");
    }

    #[tokio::test]
    async fn non_owner_cannot_update_profile() {
        let state = test_state().await;
        let (victim_id, _) = seed_user(&state, "victim@example.com", "Victim").await;
        let (_, attacker_token) = seed_user(&state, "other@example.com", "Other").await;

        let result = update_user(
            State(state),
            auth_headers(&attacker_token),
            Path(victim_id),
            Json(UpdateUserRequest {
                name: Some("Hacked".to_string()),
                phone: None,
                address: None,
                is_seller: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn user_list_is_admin_only() {
        let state = test_state().await;
        let (_, buyer_token) = seed_user(&state, "buyer@example.com", "Buyer").await;
        let (_, admin_token) = seed_user(&state, TEST_ADMIN_EMAIL, "Admin").await;

        assert!(matches!(
            list_users(State(state.clone()), auth_headers(&buyer_token)).await,
            Err(ApiError::Forbidden(_))
        ));

        let res = list_users(State(state), auth_headers(&admin_token))
            .await
            .unwrap();
        assert_eq!(res.0.total, 2);
    }

    #[tokio::test]
    async fn get_unknown_user_is_not_found() {
        let state = test_state().await;
        let (_, token) = seed_user(&state, "a@example.com", "A").await;

        let result = get_user(
            State(state),
            auth_headers(&token),
            Path("no-such-user".to_string()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
