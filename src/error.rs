//! API Error
//! 全ハンドラ共通のエラー種別と HTTP ステータスへのマッピング

use axum::{http::StatusCode, response::IntoResponse, response::Json, response::Response};
use tracing::warn;

/// ドメイン操作が返すエラー種別
///
/// 役割・所有権チェックは書き込み前に行うため、どのエラーでも
/// エンティティが中途半端な状態で残ることはない。
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// セッションが無い・無効
    #[error("{0}")]
    Unauthenticated(String),

    /// 認証済みだが権限・所有権が無い
    #[error("{0}")]
    Forbidden(String),

    /// 参照先エンティティが存在しない
    #[error("{0}")]
    NotFound(String),

    /// 入力不正
    #[error("{0}")]
    Validation(String),

    /// 状態遷移ルール違反
    #[error("{0}")]
    InvalidTransition(String),

    /// バックエンドストア障害・タイムアウト（リトライ可能）
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// その他の内部エラー（ファイルIOなど）
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::InvalidTransition(_) => "invalid_transition",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.kind(),
            "message": self.to_string(),
        })
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!("API Error [{}]: {}", self.kind(), self);
        (self.status(), Json(self.body())).into_response()
    }
}

// ストア呼び出しの失敗は一律 Unavailable（呼び出し側でリトライ）
impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Internal(format!("IO error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            ApiError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::InvalidTransition("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn error_body_envelope_shape() {
        let body = ApiError::NotFound("Listing not found: LST_X".into()).body();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "Listing not found: LST_X");
    }

    #[test]
    fn validation_and_transition_share_status_but_not_kind() {
        let v = ApiError::Validation("x".into());
        let t = ApiError::InvalidTransition("x".into());
        assert_eq!(v.status(), t.status());
        assert_ne!(v.kind(), t.kind());
    }
}
