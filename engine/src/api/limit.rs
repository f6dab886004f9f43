use crate::api::response::error_response;
use crate::api::state::ApiState;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use errors::ErrorCode;
use std::net::SocketAddr;

/// 固定窗口限流，按客户端 IP 计数
pub async fn rate_limit_middleware(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.limiter
        && !limiter.check(&addr.ip().to_string())
    {
        return error_response(ErrorCode::RateLimit);
    }
    next.run(request).await
}
