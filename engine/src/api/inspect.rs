use crate::api::response::{error_response, error_slot};
use crate::api::state::ApiState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{IntoResponse, Response};
use common::model::config::{Config, QueueConfig};
use common::model::inspect::InspectLink;
use common::model::job::{Job, JobLink, SlotOutcome};
use errors::ErrorCode;
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct InspectQuery {
    pub url: Option<String>,
    pub s: Option<String>,
    pub a: Option<String>,
    pub d: Option<String>,
    pub m: Option<String>,
    pub price: Option<String>,
    #[serde(rename = "priceKey")]
    pub price_key: Option<String>,
}

/// GET / — 单链接检视
pub async fn inspect(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<InspectQuery>,
) -> Response {
    let link = match &query.url {
        Some(url) => InspectLink::parse_url(url),
        None => InspectLink::from_parts(
            query.s.as_deref(),
            query.a.as_deref(),
            query.d.as_deref(),
            query.m.as_deref(),
        ),
    };
    let Ok(link) = link else {
        return error_response(ErrorCode::InvalidInspect);
    };

    let price = accepted_price(
        &state.config,
        &link,
        query.price.as_deref(),
        query.price_key.as_deref(),
    );
    let job = Arc::new(Job::new(
        addr.ip().to_string(),
        false,
        vec![JobLink { link, price }],
    ));

    if let Err(code) = run_job(&state, &job).await {
        return error_response(code);
    }
    match &job.outcomes()[0] {
        SlotOutcome::Item(item) => Json(json!({ "iteminfo": item })).into_response(),
        SlotOutcome::Failed(code) => error_response(*code),
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkBody {
    pub bulk_key: Option<String>,
    #[serde(rename = "priceKey")]
    pub price_key: Option<String>,
    #[serde(default)]
    pub links: Vec<BulkLink>,
}

#[derive(Debug, Deserialize)]
pub struct BulkLink {
    pub link: String,
    pub price: Option<String>,
}

/// POST /bulk — 批量检视，响应按 asset id 汇总
pub async fn bulk(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<BulkBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return error_response(ErrorCode::BadBody);
    };

    if let Some(expected) = &state.config.api.bulk_key
        && body.bulk_key.as_deref() != Some(expected.as_str())
    {
        return error_response(ErrorCode::BadSecret);
    }
    if body.links.is_empty() {
        return error_response(ErrorCode::BadBody);
    }
    let cap = state.config.queue.max_simultaneous_requests;
    if cap > 0 && body.links.len() > cap {
        return error_response(ErrorCode::MaxRequests);
    }

    let mut links = Vec::with_capacity(body.links.len());
    for entry in &body.links {
        let Ok(link) = InspectLink::parse_url(&entry.link) else {
            return error_response(ErrorCode::InvalidInspect);
        };
        let price = accepted_price(
            &state.config,
            &link,
            entry.price.as_deref(),
            body.price_key.as_deref(),
        );
        links.push(JobLink { link, price });
    }

    let job = Arc::new(Job::new(addr.ip().to_string(), true, links));
    if let Err(code) = run_job(&state, &job).await {
        return error_response(code);
    }

    let mut reply = serde_json::Map::new();
    for (job_link, outcome) in job.links.iter().zip(job.outcomes()) {
        let value = match outcome {
            SlotOutcome::Item(item) => json!(item),
            SlotOutcome::Failed(code) => error_slot(code),
        };
        reply.insert(job_link.link.a.clone(), value);
    }
    Json(serde_json::Value::Object(reply)).into_response()
}

/// 缓存命中后，残余链接过入场检查再入队，等任务完成
async fn run_job(state: &ApiState, job: &Arc<Job>) -> Result<(), ErrorCode> {
    if let Err(e) = state.cache.resolve_job(job).await {
        debug!("Cache resolution failed: {}", e);
    }
    if job.remaining() == 0 {
        return Ok(());
    }
    admission_check(
        state.fleet.ready_count(),
        state.queue.user_load(&job.client),
        state.queue.size(),
        job.remaining(),
        &state.config.queue,
    )?;
    state.queue.add_job(job);
    job.wait().await;
    Ok(())
}

/// 入场检查；只对未被缓存吸收的残余执行
pub fn admission_check(
    ready_sessions: usize,
    user_load: usize,
    queue_size: usize,
    remaining: usize,
    config: &QueueConfig,
) -> Result<(), ErrorCode> {
    if ready_sessions == 0 {
        return Err(ErrorCode::SteamOffline);
    }
    if config.max_simultaneous_requests > 0
        && user_load + remaining > config.max_simultaneous_requests
    {
        return Err(ErrorCode::MaxRequests);
    }
    if config.max_queue_size > 0 && queue_size + remaining > config.max_queue_size {
        return Err(ErrorCode::MaxQueueSize);
    }
    Ok(())
}

/// 接受报价的条件：配置了 price_key、键匹配、纯数字、市场链接
pub fn accepted_price(
    config: &Config,
    link: &InspectLink,
    price: Option<&str>,
    submitted_key: Option<&str>,
) -> Option<i64> {
    let expected = config.api.price_key.as_deref()?;
    if submitted_key? != expected {
        return None;
    }
    let price = price?;
    if price.is_empty() || !price.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !link.is_market() {
        return None;
    }
    price.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_config(max_simultaneous: usize, max_queue: usize) -> QueueConfig {
        QueueConfig {
            max_simultaneous_requests: max_simultaneous,
            max_queue_size: max_queue,
        }
    }

    #[test]
    fn test_admission_steam_offline() {
        let config = queue_config(0, 0);
        assert_eq!(
            admission_check(0, 0, 0, 1, &config),
            Err(ErrorCode::SteamOffline)
        );
        assert_eq!(admission_check(1, 0, 0, 1, &config), Ok(()));
    }

    #[test]
    fn test_admission_per_client_cap() {
        let config = queue_config(2, 0);
        // 三个链接的批量直接超帽
        assert_eq!(
            admission_check(1, 0, 0, 3, &config),
            Err(ErrorCode::MaxRequests)
        );
        // 已有一单在途时第二单到帽
        assert_eq!(
            admission_check(1, 1, 0, 1, &config),
            Ok(())
        );
        assert_eq!(
            admission_check(1, 2, 0, 1, &config),
            Err(ErrorCode::MaxRequests)
        );
    }

    #[test]
    fn test_admission_queue_cap_is_monotonic() {
        let small = queue_config(0, 10);
        let large = queue_config(0, 50);
        for queue_size in 0..60 {
            for remaining in 1..5 {
                if admission_check(1, 0, queue_size, remaining, &small).is_ok() {
                    // 扩大 max_queue_size 不会拒绝原本能过的负载
                    assert_eq!(
                        admission_check(1, 0, queue_size, remaining, &large),
                        Ok(())
                    );
                }
            }
        }
        assert_eq!(
            admission_check(1, 0, 10, 1, &small),
            Err(ErrorCode::MaxQueueSize)
        );
    }

    fn price_config(key: Option<&str>) -> Config {
        Config::parse(&format!(
            r#"
            name = "t"
            [api]
            port = 1
            {}
            [bots]
            max_online_bots = 1
            "#,
            key.map(|k| format!("price_key = \"{k}\"")).unwrap_or_default()
        ))
        .unwrap()
    }

    fn market_link() -> InspectLink {
        InspectLink::from_parts(None, Some("1"), Some("2"), Some("3")).unwrap()
    }

    fn owner_link() -> InspectLink {
        InspectLink::from_parts(Some("9"), Some("1"), Some("2"), None).unwrap()
    }

    #[test]
    fn test_price_acceptance() {
        let config = price_config(Some("k"));
        assert_eq!(
            accepted_price(&config, &market_link(), Some("1500"), Some("k")),
            Some(1500)
        );
        // 键不匹配
        assert_eq!(
            accepted_price(&config, &market_link(), Some("1500"), Some("x")),
            None
        );
        // 非数字
        assert_eq!(
            accepted_price(&config, &market_link(), Some("15.5"), Some("k")),
            None
        );
        // 非市场链接
        assert_eq!(
            accepted_price(&config, &owner_link(), Some("1500"), Some("k")),
            None
        );
        // 未配置 price_key
        let unconfigured = price_config(None);
        assert_eq!(
            accepted_price(&unconfigured, &market_link(), Some("1500"), Some("k")),
            None
        );
    }
}
