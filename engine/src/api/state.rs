use crate::fleet::Fleet;
use common::model::config::Config;
use proxy::ProxyPool;
use queue::InspectQueue;
use std::sync::Arc;
use storage::CacheFacade;
use utils::rate_limit::FixedWindowRateLimiter;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub fleet: Arc<Fleet>,
    pub queue: Arc<InspectQueue>,
    pub pool: Option<Arc<ProxyPool>>,
    pub cache: Arc<CacheFacade>,
    pub limiter: Option<Arc<FixedWindowRateLimiter>>,
}
