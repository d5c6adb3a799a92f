//! Orders API Handlers
//! /api/orders エンドポイント - 発注と配送ステータス管理
//!
//! 状態機械: pending → processing → shipped → delivered（前方のみ、飛び越し可）。
//! cancelled は非終端からのみ。更新は観測した現在ステータスを条件に含む
//! compare-and-set で行い、同時更新の負けた側は InvalidTransition になる。

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::auth;
use crate::error::ApiError;
use crate::models::{
    listing_status, order_status, Listing, Order, OrderResponse, PlaceOrderRequest,
    UpdateOrderStatusRequest,
};
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct OrderListResponse {
    pub success: bool,
    pub orders: Vec<OrderResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct OrderDetailResponse {
    pub success: bool,
    pub order: OrderResponse,
}

// ========================================
// Handlers
// ========================================

/// POST /api/orders - 発注（買い手）
///
/// approved な Listing に対してのみ。Listing の名称・価格・画像と
/// seller_id、買い手の連絡先を発注時点でスナップショットするため、
/// 以後の Listing 編集は既存注文に影響しない。
pub async fn place_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<Json<OrderDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    // approved 以外（および不存在）は NotFound で区別しない
    let listing: Option<Listing> = sqlx::query_as(
        "SELECT * FROM listings WHERE listing_id = ? AND status = ?",
    )
    .bind(&req.listing_id)
    .bind(listing_status::APPROVED)
    .fetch_optional(&state.db)
    .await?;

    let listing = listing.ok_or_else(|| {
        ApiError::NotFound(format!("Listing not found: {}", req.listing_id))
    })?;

    if listing.seller_id == caller.user_id() {
        return Err(ApiError::Validation(
            "Cannot order your own listing".to_string(),
        ));
    }

    let order_id = generate_order_id();
    let now_ms = chrono::Utc::now().timestamp_millis();

    sqlx::query(r#"
        INSERT INTO orders (
            order_id, listing_id, buyer_id, seller_id,
            title, price, image_url,
            buyer_name, buyer_phone, buyer_address,
            status, created_at_ms, updated_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#)
    .bind(&order_id)
    .bind(&listing.listing_id)
    .bind(caller.user_id())
    .bind(&listing.seller_id)
    .bind(&listing.title)
    .bind(listing.price)
    .bind(&listing.image_url)
    .bind(&caller.user.name)
    .bind(&caller.user.phone)
    .bind(&caller.user.address)
    .bind(order_status::PENDING)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&state.db)
    .await?;

    info!(
        "Order placed: order_id={}, listing_id={}, buyer={}",
        order_id,
        listing.listing_id,
        caller.user_id()
    );

    let order = fetch_order(&state, &order_id).await?;
    Ok(Json(OrderDetailResponse {
        success: true,
        order: OrderResponse::from_order(&order),
    }))
}

/// PUT /api/orders/:order_id/status - ステータス更新（注文の seller のみ）
pub async fn update_order_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(req): Json<UpdateOrderStatusRequest>,
) -> Result<Json<OrderDetailResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let new_status = order_status::parse(&req.status)
        .ok_or_else(|| ApiError::Validation(format!("Unknown status: {}", req.status)))?;

    let order = fetch_order(&state, &order_id).await?;

    if order.seller_id != caller.user_id() {
        return Err(ApiError::Forbidden(
            "Only the order's seller may update its status".to_string(),
        ));
    }

    if !order_status::can_transition(order.status, new_status) {
        return Err(ApiError::InvalidTransition(format!(
            "Cannot transition order from {} to {}",
            order_status::label(order.status),
            order_status::label(new_status)
        )));
    }

    // 観測したステータスを条件にした compare-and-set。
    // 別セッションが先に遷移させていたら 0行更新になる。
    let now_ms = chrono::Utc::now().timestamp_millis();
    let result = sqlx::query(
        "UPDATE orders SET status = ?, updated_at_ms = ? WHERE order_id = ? AND status = ?",
    )
    .bind(new_status)
    .bind(now_ms)
    .bind(&order_id)
    .bind(order.status)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::InvalidTransition(format!(
            "Order status changed concurrently: {}",
            order_id
        )));
    }

    info!(
        "Order status updated: order_id={}, {} -> {}",
        order_id,
        order_status::label(order.status),
        order_status::label(new_status)
    );

    let order = fetch_order(&state, &order_id).await?;
    Ok(Json(OrderDetailResponse {
        success: true,
        order: OrderResponse::from_order(&order),
    }))
}

/// GET /api/orders/purchases - 自分が買い手の注文一覧
pub async fn list_purchases(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<OrderListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let orders: Vec<Order> = sqlx::query_as(
        "SELECT * FROM orders WHERE buyer_id = ? ORDER BY created_at_ms DESC",
    )
    .bind(caller.user_id())
    .fetch_all(&state.db)
    .await?;

    Ok(Json(to_list_response(&orders)))
}

/// GET /api/orders/sales - 自分が売り手の注文一覧
pub async fn list_sales(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<OrderListResponse>, ApiError> {
    let caller = auth::require_session(&state.db, &state.admin_email, &headers).await?;

    let orders: Vec<Order> = sqlx::query_as(
        "SELECT * FROM orders WHERE seller_id = ? ORDER BY created_at_ms DESC",
    )
    .bind(caller.user_id())
    .fetch_all(&state.db)
    .await?;

    Ok(Json(to_list_response(&orders)))
}

// ========================================
// Helper Functions
// ========================================

fn generate_order_id() -> String {
    let random_bytes: [u8; 5] = rand::thread_rng().gen();
    let encoded = base32::encode(base32::Alphabet::Crockford, &random_bytes);
    format!("ORD_{}", &encoded[..8])
}

async fn fetch_order(state: &AppState, order_id: &str) -> Result<Order, ApiError> {
    let order: Option<Order> = sqlx::query_as("SELECT * FROM orders WHERE order_id = ?")
        .bind(order_id)
        .fetch_optional(&state.db)
        .await?;
    order.ok_or_else(|| ApiError::NotFound(format!("Order not found: {}", order_id)))
}

fn to_list_response(orders: &[Order]) -> OrderListResponse {
    let responses: Vec<OrderResponse> = orders.iter().map(OrderResponse::from_order).collect();
    let total = responses.len();
    OrderListResponse {
        success: true,
        orders: responses,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{auth_headers, seed_listing, seed_user, test_state};

    async fn place(
        state: &Arc<AppState>,
        token: &str,
        listing_id: &str,
    ) -> Result<Json<OrderDetailResponse>, ApiError> {
        place_order(
            State(state.clone()),
            auth_headers(token),
            Json(PlaceOrderRequest {
                listing_id: listing_id.to_string(),
            }),
        )
        .await
    }

    async fn set_status(
        state: &Arc<AppState>,
        token: &str,
        order_id: &str,
        status: &str,
    ) -> Result<Json<OrderDetailResponse>, ApiError> {
        update_order_status(
            State(state.clone()),
            auth_headers(token),
            Path(order_id.to_string()),
            Json(UpdateOrderStatusRequest {
                status: status.to_string(),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn place_requires_approved_listing() {
        let state = test_state().await;
        let (seller_id, _) = seed_user(&state, "s@example.com", "Seller").await;
        let (_, buyer_token) = seed_user(&state, "b@example.com", "Buyer").await;

        // pending の Listing には発注できない（NotFound で隠す)
        let pending =
            seed_listing(&state, &seller_id, "Lamp", 500, listing_status::PENDING).await;
        assert!(matches!(
            place(&state, &buyer_token, &pending).await,
            Err(ApiError::NotFound(_))
        ));

        // 不存在も NotFound
        assert!(matches!(
            place(&state, &buyer_token, "LST_MISSING1").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn order_snapshot_survives_listing_edit() {
        let state = test_state().await;
        let (seller_id, _) = seed_user(&state, "s@example.com", "Seller").await;
        let (_, buyer_token) = seed_user(&state, "b@example.com", "Buyer").await;
        let listing_id =
            seed_listing(&state, &seller_id, "Lamp", 500, listing_status::APPROVED).await;

        let order = place(&state, &buyer_token, &listing_id).await.unwrap();
        assert_eq!(order.0.order.title, "Lamp");
        assert_eq!(order.0.order.price, 500);
        assert_eq!(order.0.order.status, "pending");
        assert_eq!(order.0.order.seller_id, seller_id);

        // Listing を後から書き換えても注文のスナップショットは不変
        sqlx::query("UPDATE listings SET title = 'Expensive Lamp', price = 9999 WHERE listing_id = ?")
            .bind(&listing_id)
            .execute(&state.db)
            .await
            .unwrap();

        let purchases = list_purchases(State(state.clone()), auth_headers(&buyer_token))
            .await
            .unwrap();
        assert_eq!(purchases.0.total, 1);
        assert_eq!(purchases.0.orders[0].title, "Lamp");
        assert_eq!(purchases.0.orders[0].price, 500);
    }

    #[tokio::test]
    async fn cannot_order_own_listing() {
        let state = test_state().await;
        let (seller_id, seller_token) = seed_user(&state, "s@example.com", "Seller").await;
        let listing_id =
            seed_listing(&state, &seller_id, "Lamp", 500, listing_status::APPROVED).await;

        assert!(matches!(
            place(&state, &seller_token, &listing_id).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn only_seller_updates_status_and_transitions_are_checked() {
        let state = test_state().await;
        let (seller_id, seller_token) = seed_user(&state, "s@example.com", "Seller").await;
        let (_, buyer_token) = seed_user(&state, "b@example.com", "Buyer").await;
        let listing_id =
            seed_listing(&state, &seller_id, "Lamp", 500, listing_status::APPROVED).await;

        let order = place(&state, &buyer_token, &listing_id).await.unwrap();
        let order_id = order.0.order.order_id.clone();

        // 買い手は更新不可
        assert!(matches!(
            set_status(&state, &buyer_token, &order_id, "shipped").await,
            Err(ApiError::Forbidden(_))
        ));

        // pending → shipped（飛び越し）は許可
        let updated = set_status(&state, &seller_token, &order_id, "shipped")
            .await
            .unwrap();
        assert_eq!(updated.0.order.status, "shipped");

        // shipped → pending は後退なので拒否
        assert!(matches!(
            set_status(&state, &seller_token, &order_id, "pending").await,
            Err(ApiError::InvalidTransition(_))
        ));

        // 未知のステータス文字列は Validation
        assert!(matches!(
            set_status(&state, &seller_token, &order_id, "teleported").await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn delivered_and_cancelled_are_terminal() {
        let state = test_state().await;
        let (seller_id, seller_token) = seed_user(&state, "s@example.com", "Seller").await;
        let (_, buyer_token) = seed_user(&state, "b@example.com", "Buyer").await;
        let listing_id =
            seed_listing(&state, &seller_id, "Lamp", 500, listing_status::APPROVED).await;

        let order = place(&state, &buyer_token, &listing_id).await.unwrap();
        let order_id = order.0.order.order_id.clone();
        set_status(&state, &seller_token, &order_id, "delivered")
            .await
            .unwrap();
        assert!(matches!(
            set_status(&state, &seller_token, &order_id, "cancelled").await,
            Err(ApiError::InvalidTransition(_))
        ));

        let order2 = place(&state, &buyer_token, &listing_id).await.unwrap();
        let order2_id = order2.0.order.order_id.clone();
        set_status(&state, &seller_token, &order2_id, "cancelled")
            .await
            .unwrap();
        assert!(matches!(
            set_status(&state, &seller_token, &order2_id, "processing").await,
            Err(ApiError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn full_marketplace_flow() {
        use crate::handlers::listings;
        use crate::test_util::TEST_ADMIN_EMAIL;

        let state = test_state().await;
        let (seller_id, seller_token) = seed_user(&state, "s@example.com", "Seller").await;
        let (_, buyer_token) = seed_user(&state, "b@example.com", "Buyer").await;
        let (_, admin_token) = seed_user(&state, TEST_ADMIN_EMAIL, "Admin").await;

        // 出品 → pending の間は発注不可
        let listing_id =
            seed_listing(&state, &seller_id, "Teapot", 1200, listing_status::PENDING).await;
        assert!(matches!(
            place(&state, &buyer_token, &listing_id).await,
            Err(ApiError::NotFound(_))
        ));

        // admin 承認 → 発注可能に
        listings::approve_listing(
            State(state.clone()),
            auth_headers(&admin_token),
            Path(listing_id.clone()),
        )
        .await
        .unwrap();

        let order = place(&state, &buyer_token, &listing_id).await.unwrap();
        let order_id = order.0.order.order_id.clone();
        assert_eq!(order.0.order.status, "pending");

        // seller が出荷まで進める
        set_status(&state, &seller_token, &order_id, "processing")
            .await
            .unwrap();
        let shipped = set_status(&state, &seller_token, &order_id, "shipped")
            .await
            .unwrap();
        assert_eq!(shipped.0.order.status, "shipped");

        // 買い手側の購入一覧に反映されている
        let purchases = list_purchases(State(state), auth_headers(&buyer_token))
            .await
            .unwrap();
        assert_eq!(purchases.0.orders[0].status, "shipped");
        assert_eq!(purchases.0.orders[0].title, "Teapot");
    }

    #[tokio::test]
    async fn purchases_and_sales_are_caller_scoped() {
        let state = test_state().await;
        let (seller_id, seller_token) = seed_user(&state, "s@example.com", "Seller").await;
        let (_, buyer_token) = seed_user(&state, "b@example.com", "Buyer").await;
        let (_, other_token) = seed_user(&state, "o@example.com", "Other").await;
        let listing_id =
            seed_listing(&state, &seller_id, "Lamp", 500, listing_status::APPROVED).await;

        place(&state, &buyer_token, &listing_id).await.unwrap();

        let sales = list_sales(State(state.clone()), auth_headers(&seller_token))
            .await
            .unwrap();
        assert_eq!(sales.0.total, 1);
        // 買い手連絡先のスナップショットが seller に見える
        assert_eq!(sales.0.orders[0].buyer_name, "Buyer");
        assert_eq!(sales.0.orders[0].buyer_phone, "555-0100");

        let other_purchases = list_purchases(State(state.clone()), auth_headers(&other_token))
            .await
            .unwrap();
        assert_eq!(other_purchases.0.total, 0);
        let other_sales = list_sales(State(state), auth_headers(&other_token))
            .await
            .unwrap();
        assert_eq!(other_sales.0.total, 0);
    }
}
