//! Listings API Handlers
//! /api/listings エンドポイント - 出品の提出・閲覧と admin 承認フロー
//!
//! 状態機械: pending(初期) → approved | rejected(行削除、終端)。
//! pending からの遷移は admin のみ。遷移は現在ステータスを条件に含む
//! 単一 UPDATE/DELETE で行い、同時実行の二重承認は 0行更新として検出する。

use axum::{
    extract::{Multipart, Path, State},
    http::HeaderMap,
    response::Json,
};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::auth;
use crate::error::ApiError;
use crate::models::{listing_status, Listing, ListingResponse};
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct ListingListResponse {
    pub success: bool,
    pub listings: Vec<ListingResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct ListingDetailResponse {
    pub success: bool,
    pub listing: ListingResponse,
}

#[derive(Serialize)]
pub struct RejectResponse {
    pub success: bool,
    pub message: String,
}

// ========================================
// Handlers
// ========================================

/// POST /api/listings - 出品提出（Multipart: title, description, price, image）
///
/// 提出直後は必ず pending。買い手の一覧には admin 承認まで出ない。
pub async fn submit_listing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ListingDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    // フォームデータを収集
    let mut title: Option<String> = None;
    let mut description: Option<String> = None;
    let mut price: Option<i64> = None;
    let mut image_data: Option<Vec<u8>> = None;
    let mut image_filename: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "title" => {
                title = Some(field.text().await.unwrap_or_default());
            }
            "description" => {
                description = Some(field.text().await.unwrap_or_default());
            }
            "price" => {
                let text = field.text().await.unwrap_or_default();
                price = Some(text.trim().parse::<i64>().map_err(|_| {
                    ApiError::Validation(format!("price must be an integer: {}", text))
                })?);
            }
            "image" => {
                image_filename = field.file_name().map(|s| s.to_string());
                image_data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::Validation(format!("Image read error: {}", e)))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let title = title.unwrap_or_default();
    let description = description.unwrap_or_default();
    let price = price.ok_or_else(|| ApiError::Validation("price is required".to_string()))?;
    validate_draft(&title, &description, price, image_data.is_some())?;
    let image_data =
        image_data.ok_or_else(|| ApiError::Validation("image is required".to_string()))?;

    let listing_id = generate_listing_id();
    let now_ms = chrono::Utc::now().timestamp_millis();

    // 画像保存（Blob Store 相当、/media 配下で配信）
    let ext = image_filename
        .as_deref()
        .and_then(|f| f.split('.').last())
        .unwrap_or("jpg")
        .to_lowercase();
    let filename = format!("image.{}", ext);
    let dir = PathBuf::from(&state.base_data_dir)
        .join("listings")
        .join(&listing_id);
    fs::create_dir_all(&dir).await?;
    let mut file = fs::File::create(dir.join(&filename)).await?;
    file.write_all(&image_data).await?;

    let image_url = format!(
        "{}/media/listings/{}/{}",
        state.public_base_url, listing_id, filename
    );

    // DB挿入。失敗したら保存済み画像を孤児にしない
    let insert = sqlx::query(r#"
        INSERT INTO listings (
            listing_id, seller_id, seller_name, title, description,
            price, image_url, status, created_at_ms, updated_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#)
    .bind(&listing_id)
    .bind(caller.user_id())
    .bind(&caller.user.name)
    .bind(title.trim())
    .bind(description.trim())
    .bind(price)
    .bind(&image_url)
    .bind(listing_status::PENDING)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&state.db)
    .await;

    if let Err(e) = insert {
        if let Err(rm) = fs::remove_dir_all(&dir).await {
            warn!("Failed to remove listing image dir {:?}: {}", dir, rm);
        }
        return Err(e.into());
    }

    info!(
        "Listing submitted: listing_id={}, seller={}, title={}",
        listing_id,
        caller.user_id(),
        title.trim()
    );

    let listing: Listing = sqlx::query_as("SELECT * FROM listings WHERE listing_id = ?")
        .bind(&listing_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(ListingDetailResponse {
        success: true,
        listing: ListingResponse::from_listing(&listing),
    }))
}

/// GET /api/listings - 承認済み一覧（買い手向けブラウズ）
pub async fn list_approved(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListingListResponse>, ApiError> {
    let _caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let listings: Vec<Listing> = sqlx::query_as(
        "SELECT * FROM listings WHERE status = ? ORDER BY created_at_ms DESC",
    )
    .bind(listing_status::APPROVED)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(to_list_response(&listings)))
}

/// GET /api/listings/mine - 自分の出品一覧（全ステータス）
pub async fn list_mine(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListingListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let listings: Vec<Listing> = sqlx::query_as(
        "SELECT * FROM listings WHERE seller_id = ? ORDER BY created_at_ms DESC",
    )
    .bind(caller.user_id())
    .fetch_all(&state.db)
    .await?;

    Ok(Json(to_list_response(&listings)))
}

/// GET /api/listings/pending - 承認待ちキュー（admin のみ）
pub async fn list_pending(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListingListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    auth::require_admin(&caller)?;

    let listings: Vec<Listing> = sqlx::query_as(
        "SELECT * FROM listings WHERE status = ? ORDER BY created_at_ms ASC",
    )
    .bind(listing_status::PENDING)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(to_list_response(&listings)))
}

/// GET /api/listings/:listing_id - 出品詳細
///
/// pending は出品者本人と admin のみに見える。他者には存在ごと隠す。
pub async fn get_listing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(listing_id): Path<String>,
) -> Result<Json<ListingDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let listing = fetch_listing(&state, &listing_id).await?;

    if listing.status == listing_status::PENDING
        && listing.seller_id != caller.user_id()
        && !caller.is_admin()
    {
        return Err(not_found(&listing_id));
    }

    Ok(Json(ListingDetailResponse {
        success: true,
        listing: ListingResponse::from_listing(&listing),
    }))
}

/// POST /api/listings/:listing_id/approve - 承認（admin のみ）
///
/// pending → approved の compare-and-set。同じ listing に同時に承認が
/// 走った場合、負けた側は 0行更新となり InvalidTransition を受け取る。
pub async fn approve_listing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(listing_id): Path<String>,
) -> Result<Json<ListingDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    auth::require_admin(&caller)?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let result = sqlx::query(
        "UPDATE listings SET status = ?, updated_at_ms = ? WHERE listing_id = ? AND status = ?",
    )
    .bind(listing_status::APPROVED)
    .bind(now_ms)
    .bind(&listing_id)
    .bind(listing_status::PENDING)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        // 行が無いのか、既に pending でないのかを切り分ける
        let existing: Option<Listing> =
            sqlx::query_as("SELECT * FROM listings WHERE listing_id = ?")
                .bind(&listing_id)
                .fetch_optional(&state.db)
                .await?;
        return Err(match existing {
            None => not_found(&listing_id),
            Some(_) => ApiError::InvalidTransition(format!(
                "Listing is not pending: {}",
                listing_id
            )),
        });
    }

    info!("Listing approved: listing_id={}, admin={}", listing_id, caller.user_id());

    let listing = fetch_listing(&state, &listing_id).await?;
    Ok(Json(ListingDetailResponse {
        success: true,
        listing: ListingResponse::from_listing(&listing),
    }))
}

/// POST /api/listings/:listing_id/reject - 却下（admin のみ、行ごと削除）
///
/// 墓石は残さない。以後の get は NotFound になる。
pub async fn reject_listing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(listing_id): Path<String>,
) -> Result<Json<RejectResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;
    auth::require_admin(&caller)?;

    // approve と同じ compare-and-set 規律（pending 以外は削除しない）
    let result = sqlx::query("DELETE FROM listings WHERE listing_id = ? AND status = ?")
        .bind(&listing_id)
        .bind(listing_status::PENDING)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        let existing: Option<Listing> =
            sqlx::query_as("SELECT * FROM listings WHERE listing_id = ?")
                .bind(&listing_id)
                .fetch_optional(&state.db)
                .await?;
        return Err(match existing {
            None => not_found(&listing_id),
            Some(_) => ApiError::InvalidTransition(format!(
                "Listing is not pending: {}",
                listing_id
            )),
        });
    }

    // 画像削除（ベストエフォート）
    let dir = PathBuf::from(&state.base_data_dir)
        .join("listings")
        .join(&listing_id);
    if let Err(e) = fs::remove_dir_all(&dir).await {
        warn!("Failed to remove listing image dir {:?}: {}", dir, e);
    }

    info!("Listing rejected: listing_id={}, admin={}", listing_id, caller.user_id());

    Ok(Json(RejectResponse {
        success: true,
        message: format!("Rejected {}", listing_id),
    }))
}

// ========================================
// Helper Functions
// ========================================

/// 提出内容の検証
pub fn validate_draft(
    title: &str,
    description: &str,
    price: i64,
    has_image: bool,
) -> Result<(), ApiError> {
    if title.trim().is_empty() {
        return Err(ApiError::Validation("title is required".to_string()));
    }
    if description.trim().is_empty() {
        return Err(ApiError::Validation("description is required".to_string()));
    }
    if price <= 0 {
        return Err(ApiError::Validation("price must be positive".to_string()));
    }
    if !has_image {
        return Err(ApiError::Validation("image is required".to_string()));
    }
    Ok(())
}

fn generate_listing_id() -> String {
    let random_bytes: [u8; 5] = rand::thread_rng().gen();
    let encoded = base32::encode(base32::Alphabet::Crockford, &random_bytes);
    format!("LST_{}", &encoded[..8])
}

async fn fetch_listing(state: &AppState, listing_id: &str) -> Result<Listing, ApiError> {
    let listing: Option<Listing> = sqlx::query_as("SELECT * FROM listings WHERE listing_id = ?")
        .bind(listing_id)
        .fetch_optional(&state.db)
        .await?;
    listing.ok_or_else(|| not_found(listing_id))
}

fn not_found(listing_id: &str) -> ApiError {
    ApiError::NotFound(format!("Listing not found: {}", listing_id))
}

fn to_list_response(listings: &[Listing]) -> ListingListResponse {
    let responses: Vec<ListingResponse> =
        listings.iter().map(ListingResponse::from_listing).collect();
    let total = responses.len();
    ListingListResponse {
        success: true,
        listings: responses,
        total,
    }
}
