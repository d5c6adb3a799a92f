//! Data Models
//! User, Listing, Order, Conversation, Message のデータ構造定義

use serde::{Deserialize, Serialize};

// ========================================
// Role
// ========================================

/// 導出ロール（DBには保存しない）
///
/// admin は予約メールアドレス一致でのみ導出。buyer/seller は自己申告の
/// `is_seller` フラグによる表示上の区別で、出品可否の制約はない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
}

// ========================================
// User
// ========================================

/// User (DB row)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub phone: String,
    pub address: String,
    pub is_seller: i32,
    pub created_at_ms: i64,
}

/// 登録リクエスト
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone: String,
    pub address: String,
}

/// ログインリクエスト
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// プロフィール更新リクエスト（部分更新）
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_seller: Option<bool>,
}

/// User レスポンス（API返却用、password_hash は含めない）
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub phone: String,
    pub address: String,
    pub is_seller: bool,
    pub role: Role,
    pub created_at_ms: i64,
}

impl UserResponse {
    pub fn from_user(u: &User, role: Role) -> Self {
        Self {
            user_id: u.user_id.clone(),
            email: u.email.clone(),
            name: u.name.clone(),
            phone: u.phone.clone(),
            address: u.address.clone(),
            is_seller: u.is_seller == 1,
            role,
            created_at_ms: u.created_at_ms,
        }
    }
}

// ========================================
// Session
// ========================================

/// Session (DB row)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub token_hash: String,
    pub user_id: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

// ========================================
// Listing
// ========================================

/// Listing ステータス定数
///
/// rejected は行ごと削除するため定数を持たない。pending から先の遷移は
/// admin のみ。
pub mod listing_status {
    pub const PENDING: i32 = 0;
    pub const APPROVED: i32 = 1;
}

/// Listing (DB row)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Listing {
    pub listing_id: String,
    pub seller_id: String,
    pub seller_name: String,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub image_url: String,
    pub status: i32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Listing レスポンス（API返却用）
#[derive(Debug, Serialize)]
pub struct ListingResponse {
    pub listing_id: String,
    pub seller_id: String,
    pub seller_name: String,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub image_url: String,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ListingResponse {
    pub fn from_listing(l: &Listing) -> Self {
        let status = if l.status == listing_status::APPROVED {
            "approved"
        } else {
            "pending"
        };
        Self {
            listing_id: l.listing_id.clone(),
            seller_id: l.seller_id.clone(),
            seller_name: l.seller_name.clone(),
            title: l.title.clone(),
            description: l.description.clone(),
            price: l.price,
            image_url: l.image_url.clone(),
            status: status.to_string(),
            created_at_ms: l.created_at_ms,
            updated_at_ms: l.updated_at_ms,
        }
    }
}

// ========================================
// Order
// ========================================

/// Order ステータス定数と遷移ルール
pub mod order_status {
    pub const PENDING: i32 = 0;
    pub const PROCESSING: i32 = 1;
    pub const SHIPPED: i32 = 2;
    pub const DELIVERED: i32 = 3;
    pub const CANCELLED: i32 = 4;

    /// 終端状態か
    pub fn is_terminal(status: i32) -> bool {
        status == DELIVERED || status == CANCELLED
    }

    /// 現在ステータスから `next` へ遷移可能か
    ///
    /// pending < processing < shipped < delivered のチェーン上を前方のみ
    /// （飛び越し可）。cancelled へは非終端からのみ。
    pub fn can_transition(current: i32, next: i32) -> bool {
        if is_terminal(current) {
            return false;
        }
        if next == CANCELLED {
            return true;
        }
        matches!(next, PROCESSING | SHIPPED | DELIVERED) && next > current
    }

    /// API 文字列 → 定数
    pub fn parse(s: &str) -> Option<i32> {
        match s {
            "pending" => Some(PENDING),
            "processing" => Some(PROCESSING),
            "shipped" => Some(SHIPPED),
            "delivered" => Some(DELIVERED),
            "cancelled" => Some(CANCELLED),
            _ => None,
        }
    }

    /// 定数 → API 文字列
    pub fn label(status: i32) -> &'static str {
        match status {
            PENDING => "pending",
            PROCESSING => "processing",
            SHIPPED => "shipped",
            DELIVERED => "delivered",
            CANCELLED => "cancelled",
            _ => "unknown",
        }
    }
}

/// Order (DB row)
///
/// title/price/image_url と buyer 連絡先は発注時点のスナップショット。
/// 後から Listing や User が変更されても過去の注文には反映しない。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Order {
    pub order_id: String,
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub title: String,
    pub price: i64,
    pub image_url: String,
    pub buyer_name: String,
    pub buyer_phone: String,
    pub buyer_address: String,
    pub status: i32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// 発注リクエスト
#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest {
    pub listing_id: String,
}

/// ステータス更新リクエスト
#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
}

/// Order レスポンス（API返却用）
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub title: String,
    pub price: i64,
    pub image_url: String,
    pub buyer_name: String,
    pub buyer_phone: String,
    pub buyer_address: String,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl OrderResponse {
    pub fn from_order(o: &Order) -> Self {
        Self {
            order_id: o.order_id.clone(),
            listing_id: o.listing_id.clone(),
            buyer_id: o.buyer_id.clone(),
            seller_id: o.seller_id.clone(),
            title: o.title.clone(),
            price: o.price,
            image_url: o.image_url.clone(),
            buyer_name: o.buyer_name.clone(),
            buyer_phone: o.buyer_phone.clone(),
            buyer_address: o.buyer_address.clone(),
            status: order_status::label(o.status).to_string(),
            created_at_ms: o.created_at_ms,
            updated_at_ms: o.updated_at_ms,
        }
    }
}

// ========================================
// Conversation / Message
// ========================================

/// 参加者ペアの正準キー（ソートして ":" 連結）
///
/// getOrCreate(A,B) と getOrCreate(B,A) が同じ行に収束するための
/// UNIQUE インデックスのキー。
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// Conversation (DB row)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Conversation {
    pub conversation_id: String,
    pub pair_key: String,
    pub user_a: String,
    pub user_b: String,
    pub created_at_ms: i64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// 自分でない側の参加者
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.user_a == user_id {
            &self.user_b
        } else {
            &self.user_a
        }
    }
}

/// チャット開始リクエスト
#[derive(Debug, Deserialize)]
pub struct StartChatRequest {
    pub peer_id: String,
}

/// Conversation レスポンス（API返却用）
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub created_at_ms: i64,
}

/// Message (DB row)
///
/// seq は挿入順のタイブレーク用。sent_at_ms が同値でも全順序が定まる。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    pub seq: i64,
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub sent_at_ms: i64,
}

/// メッセージ送信リクエスト
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub text: String,
}

/// Message レスポンス（API返却用）
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub sent_at_ms: i64,
}

impl MessageResponse {
    pub fn from_message(m: &Message) -> Self {
        Self {
            message_id: m.message_id.clone(),
            conversation_id: m.conversation_id.clone(),
            sender_id: m.sender_id.clone(),
            sender_name: m.sender_name.clone(),
            text: m.text.clone(),
            sent_at_ms: m.sent_at_ms,
        }
    }
}
