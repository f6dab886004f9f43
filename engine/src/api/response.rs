use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use errors::ErrorCode;
use serde_json::json;

/// 统一的错误响应体：{ error, code }，HTTP 状态随 code 走
pub fn error_response(code: ErrorCode) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": code.message(),
            "code": code.code(),
        })),
    )
        .into_response()
}

/// bulk 响应里单个槽位的错误对象
pub fn error_slot(code: ErrorCode) -> serde_json::Value {
    json!({
        "error": code.message(),
        "code": code.code(),
        "status": code.http_status(),
    })
}
