use crate::api::response::error_response;
use crate::api::state::ApiState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use errors::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// GET /stats — 运行指标快照
pub async fn stats(State(state): State<ApiState>) -> Response {
    let mut body = json!({
        "bots_online": state.fleet.ready_count(),
        "bots_total": state.fleet.total(),
        "queue_size": state.queue.size(),
        "queue_concurrency": state.queue.concurrency(),
        "pending_auth": state.fleet.pending_auth_count(),
    });
    if let Some(pool) = &state.pool {
        body["proxy_pool"] = json!(pool.stats());
    }
    let pending = state.fleet.pending_auth_views();
    if !pending.is_empty() {
        body["pending_auth_details"] = json!(pending);
    }
    Json(body).into_response()
}

/// GET /status — 舰队健康概览
pub async fn status(State(state): State<ApiState>) -> Response {
    Json(state.fleet.status()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AuthBody {
    pub username: String,
    pub code: String,
    pub auth_key: Option<String>,
}

/// POST /auth — 给挂起的会话提交验证码
pub async fn submit_auth(
    State(state): State<ApiState>,
    body: Result<Json<AuthBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return error_response(ErrorCode::BadBody);
    };
    if let Some(expected) = &state.config.api.auth_key
        && body.auth_key.as_deref() != Some(expected.as_str())
    {
        return error_response(ErrorCode::BadSecret);
    }
    match state.fleet.submit_auth_code(&body.username, &body.code).await {
        Ok(()) => Json(json!({ "success": true, "username": body.username })).into_response(),
        Err(e) if e.is_api() => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no pending auth session for {}", body.username) })),
        )
            .into_response(),
        Err(e) => {
            log::error!("Auth code submission failed: {}", e);
            error_response(ErrorCode::GenericBad)
        }
    }
}

/// GET /pending-auth — 等待验证码的会话列表
pub async fn pending_auth(State(state): State<ApiState>) -> Response {
    Json(json!({ "pending": state.fleet.pending_auth_views() })).into_response()
}

#[derive(Serialize)]
struct ComponentStatus {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentStatus {
    fn up() -> Self {
        Self {
            status: "up",
            error: None,
        }
    }
    fn down(e: impl ToString) -> Self {
        Self {
            status: "down",
            error: Some(e.to_string()),
        }
    }
}

/// GET /healthz — 存活探针
pub async fn healthz(State(state): State<ApiState>) -> Response {
    let store = match state.cache.store().ping().await {
        Ok(()) => ComponentStatus::up(),
        Err(e) => ComponentStatus::down(e),
    };
    let online = state.fleet.ready_count();
    let fleet = if online > 0 {
        ComponentStatus::up()
    } else {
        ComponentStatus::down("no ready sessions")
    };
    let overall = if store.status == "up" && fleet.status == "up" {
        "up"
    } else {
        "degraded"
    };
    Json(json!({
        "status": overall,
        "components": { "store": store, "fleet": fleet },
    }))
    .into_response()
}
