//! Database Module
//! SQLite を使用した users/sessions/listings/orders/conversations/messages の管理

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::time::Duration;
use tracing::info;

/// データベース接続プール
pub type DbPool = Pool<Sqlite>;

/// ストア呼び出しの待ち時間上限。超過は Unavailable としてクライアントに返る。
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// データベースを初期化
pub async fn init_db(db_path: &str) -> Result<DbPool> {
    // SQLite接続文字列
    let db_url = format!("sqlite:{}?mode=rwc", db_path);

    info!("Initializing database: {}", db_path);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&db_url)
        .await?;

    // スキーマ作成
    create_schema(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// スキーマ作成
pub async fn create_schema(pool: &DbPool) -> Result<()> {
    // users テーブル
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            name TEXT NOT NULL,
            phone TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL DEFAULT '',
            is_seller INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // sessions テーブル（生トークンは保存せず sha256 ダイジェストのみ）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(user_id)
        )
    "#)
    .execute(pool)
    .await?;

    // listings テーブル（rejected は行削除のため status は pending/approved のみ）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS listings (
            listing_id TEXT PRIMARY KEY,
            seller_id TEXT NOT NULL,
            seller_name TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            price INTEGER NOT NULL,
            image_url TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            FOREIGN KEY (seller_id) REFERENCES users(user_id)
        )
    "#)
    .execute(pool)
    .await?;

    // orders テーブル（listing の title/price/image と buyer 連絡先は発注時スナップショット）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            listing_id TEXT NOT NULL,
            buyer_id TEXT NOT NULL,
            seller_id TEXT NOT NULL,
            title TEXT NOT NULL,
            price INTEGER NOT NULL,
            image_url TEXT NOT NULL,
            buyer_name TEXT NOT NULL DEFAULT '',
            buyer_phone TEXT NOT NULL DEFAULT '',
            buyer_address TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // conversations テーブル（pair_key の UNIQUE で無順序ペアごとに1行を保証）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            pair_key TEXT NOT NULL UNIQUE,
            user_a TEXT NOT NULL,
            user_b TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // messages テーブル（seq = 挿入順、sent_at_ms 同値時のタイブレーク）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            sender_name TEXT NOT NULL DEFAULT '',
            text TEXT NOT NULL,
            sent_at_ms INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(conversation_id)
        )
    "#)
    .execute(pool)
    .await?;

    // インデックス作成
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at_ms)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_seller ON listings(seller_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_buyer ON orders(buyer_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_seller ON orders(seller_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(user_a)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(user_b)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)")
        .execute(pool).await?;

    Ok(())
}

/// 期限切れセッションの掃除（定期実行用）
pub async fn sweep_expired_sessions(pool: &DbPool) -> Result<usize> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at_ms <= ?")
        .bind(now_ms)
        .execute(pool)
        .await?;

    let count = result.rows_affected() as usize;
    if count > 0 {
        info!("Swept {} expired sessions", count);
    }
    Ok(count)
}
