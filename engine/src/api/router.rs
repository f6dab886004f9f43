use crate::api::state::ApiState;
use crate::api::{admin, cors, inspect, limit};
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

pub fn router(state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/", get(inspect::inspect))
        .route("/bulk", post(inspect::bulk))
        .route("/stats", get(admin::stats))
        .route("/status", get(admin::status))
        .route("/auth", post(admin::submit_auth))
        .route("/pending-auth", get(admin::pending_auth))
        .route("/healthz", get(admin::healthz))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors::cors_middleware,
        ));
    if state.limiter.is_some() {
        app = app.layer(middleware::from_fn_with_state(
            state.clone(),
            limit::rate_limit_middleware,
        ));
    }
    app.with_state(state)
}
