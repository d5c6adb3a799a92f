use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{info, warn};

mod auth;
mod db;
mod error;
mod handlers;
mod models;

use db::DbPool;

// ========================================
// 設定
// ========================================

#[derive(Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub base_data_dir: PathBuf,
    pub public_base_url: String,
    pub bind_addr: String,
    pub admin_email: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "/data/shemarket/shemarket.db".to_string(),
            base_data_dir: PathBuf::from("/data/shemarket"),
            public_base_url: "http://localhost:3000".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            admin_email: "admin@shemarket.com".to_string(),
        }
    }
}

impl AppConfig {
    /// 環境変数で上書き可能（未指定はデフォルト）
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: std::env::var("SHEMARKET_DB_PATH").unwrap_or(d.db_path),
            base_data_dir: std::env::var("SHEMARKET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.base_data_dir),
            public_base_url: std::env::var("SHEMARKET_BASE_URL").unwrap_or(d.public_base_url),
            bind_addr: std::env::var("SHEMARKET_BIND_ADDR").unwrap_or(d.bind_addr),
            admin_email: std::env::var("SHEMARKET_ADMIN_EMAIL").unwrap_or(d.admin_email),
        }
    }
}

// ========================================
// アプリケーション状態
// ========================================

pub struct AppState {
    pub db: DbPool,
    pub base_data_dir: PathBuf,
    pub public_base_url: String,
    pub admin_email: String,
}

// ========================================
// ヘルスチェック
// ========================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "shemarket-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ========================================
// ルーター構築
// ========================================

fn build_router(state: Arc<AppState>) -> Router {
    // 公開するのは画像サブツリーのみ。data dir 直下には DB ファイルがある。
    let media_dir = state.base_data_dir.join("listings");

    Router::new()
        .route("/api/health", get(health_check))
        // 認証
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/me", get(handlers::auth::me))
        // ユーザー
        .route("/api/users", get(handlers::users::list_users))
        .route(
            "/api/users/:user_id",
            get(handlers::users::get_user).put(handlers::users::update_user),
        )
        // 出品
        .route(
            "/api/listings",
            get(handlers::listings::list_approved).post(handlers::listings::submit_listing),
        )
        .route("/api/listings/mine", get(handlers::listings::list_mine))
        .route("/api/listings/pending", get(handlers::listings::list_pending))
        .route("/api/listings/:listing_id", get(handlers::listings::get_listing))
        .route(
            "/api/listings/:listing_id/approve",
            post(handlers::listings::approve_listing),
        )
        .route(
            "/api/listings/:listing_id/reject",
            post(handlers::listings::reject_listing),
        )
        // 注文
        .route("/api/orders", post(handlers::orders::place_order))
        .route("/api/orders/purchases", get(handlers::orders::list_purchases))
        .route("/api/orders/sales", get(handlers::orders::list_sales))
        .route(
            "/api/orders/:order_id/status",
            put(handlers::orders::update_order_status),
        )
        // チャット
        .route(
            "/api/chats",
            get(handlers::chats::list_chats).post(handlers::chats::start_chat),
        )
        .route(
            "/api/chats/:conversation_id/messages",
            get(handlers::chats::list_messages).post(handlers::chats::post_message),
        )
        // 保存済み画像の配信（Blob Store 相当）
        .nest_service("/media/listings", ServeDir::new(media_dir))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB まで許可
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ========================================
// バックグラウンドジョブ
// ========================================

/// 期限切れセッションの定期掃除
fn spawn_session_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Err(e) = db::sweep_expired_sessions(&state.db).await {
                warn!("Session sweep failed: {}", e);
            }
        }
    });
}

// ========================================
// メイン
// ========================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(config.base_data_dir.join("listings")).await?;

    let db = db::init_db(&config.db_path).await?;

    let state = Arc::new(AppState {
        db,
        base_data_dir: config.base_data_dir,
        public_base_url: config.public_base_url,
        admin_email: config.admin_email,
    });

    spawn_session_sweeper(state.clone());

    let app = build_router(state);

    info!("🚀 SheMarket API Server listening on {}", config.bind_addr);
    info!("📦 Max body size: 10MB");

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}


// ========================================
// テストユーティリティ
// ========================================

#[cfg(test)]
pub mod test_util {
    use super::*;
    use axum::http::HeaderMap;

    pub const TEST_ADMIN_EMAIL: &str = "admin@shemarket.com";

    /// インメモリSQLiteで AppState を構築（接続1本で全クエリが同じDBを見る）
    pub async fn test_state() -> Arc<AppState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::create_schema(&pool).await.unwrap();

        let dir = std::env::temp_dir().join(format!("shemarket-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        Arc::new(AppState {
            db: pool,
            base_data_dir: dir,
            public_base_url: "http://localhost:3000".to_string(),
            admin_email: TEST_ADMIN_EMAIL.to_string(),
        })
    }

    pub fn auth_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}", token).parse().unwrap());
        headers
    }

    /// ユーザーを直接作成してセッションを発行
    pub async fn seed_user(state: &Arc<AppState>, email: &str, name: &str) -> (String, String) {
        let user_id = uuid::Uuid::new_v4().to_string();
        let now_ms = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO users (user_id, email, password_hash, name, phone, address, is_seller, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&user_id)
        .bind(email)
        .bind("x")
        .bind(name)
        .bind("555-0100")
        .bind("1 Test Street")
        .bind(now_ms)
        .execute(&state.db)
        .await
        .unwrap();

        let token = auth::issue_session(&state.db, &user_id).await.unwrap();
        (user_id, token)
    }

    /// Listing を直接作成（multipart を経由しないテスト用）
    pub async fn seed_listing(
        state: &Arc<AppState>,
        seller_id: &str,
        title: &str,
        price: i64,
        status: i32,
    ) -> String {
        let listing_id = format!("LST_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let now_ms = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO listings (listing_id, seller_id, seller_name, title, description,
             price, image_url, status, created_at_ms, updated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&listing_id)
        .bind(seller_id)
        .bind("Seller")
        .bind(title)
        .bind("test listing")
        .bind(price)
        .bind(format!("http://localhost:3000/media/listings/{}/image.jpg", listing_id))
        .bind(status)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&state.db)
        .await
        .unwrap();
        listing_id
    }
}
