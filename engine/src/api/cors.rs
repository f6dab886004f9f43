use crate::api::state::ApiState;
use axum::extract::{Request, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use common::model::config::Config;
use regex::Regex;

/// 带 Origin 且命中白名单时回跨域头
pub async fn cors_middleware(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = next.run(request).await;

    if let Some(origin) = origin
        && origin_allowed(&state.config, &origin)
        && let Ok(value) = HeaderValue::from_str(&origin)
    {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET"));
    }
    response
}

pub fn origin_allowed(config: &Config, origin: &str) -> bool {
    if config.api.allowed_origins.iter().any(|o| o == origin) {
        return true;
    }
    config
        .api
        .allowed_regex_origins
        .iter()
        .any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(origin))
                .unwrap_or(false)
        })
}
