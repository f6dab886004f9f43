use common::model::config::{ProxyConfig, SelectionStrategy};
use common::model::events::FailureReason;
use errors::{ProxyError, Result};
use log::{info, warn};
use metrics::counter;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 连续登录失败超过此值且成功率过低的组被标记为失效
const FAILED_LOGIN_THRESHOLD: u32 = 5;
const FAILED_SUCCESS_RATE: f32 = 0.3;
/// SteamGuard 误报强制等待 10 秒再重试，不受配置影响
const STEAM_GUARD_RETRY_DELAY: Duration = Duration::from_secs(10);

/// 池对会话的最小视图；会话本身归监督器所有
///
/// 选取时在池锁内预留会话，避免两次出队拿到同一个会话。
pub trait PoolSession: Send + Sync {
    fn id(&self) -> usize;
    fn is_available(&self) -> bool;
    fn try_reserve(&self) -> bool;
    fn release_reservation(&self);
}

/// 一次成功选取的凭据，用完必须 release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLease {
    pub group: usize,
    pub session: usize,
}

/// 登录失败后的重试决定
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub new_group: Option<usize>,
    pub new_proxy: Option<String>,
    pub retry_delay: Duration,
    pub retry_count: u32,
}

impl RetryDecision {
    fn give_up(retry_count: u32) -> Self {
        RetryDecision {
            should_retry: false,
            new_group: None,
            new_proxy: None,
            retry_delay: Duration::ZERO,
            retry_count,
        }
    }
}

struct GroupState {
    id: usize,
    url: Option<String>,
    bots: Vec<usize>,
    active_requests: u32,
    total_requests: u64,
    last_request: Option<Instant>,
    failures: u64,
    login_failures: u32,
    successful_logins: u32,
}

impl GroupState {
    fn new(id: usize, url: Option<String>) -> Self {
        GroupState {
            id,
            url,
            bots: Vec::new(),
            active_requests: 0,
            total_requests: 0,
            last_request: None,
            failures: 0,
            login_failures: 0,
            successful_logins: 0,
        }
    }

    fn success_rate(&self) -> f32 {
        let total = self.successful_logins + self.login_failures;
        if total == 0 {
            return 0.0;
        }
        self.successful_logins as f32 / total as f32
    }

    fn can_accept(&self, max_requests: u32, cooldown: Duration, now: Instant) -> bool {
        if self.active_requests >= max_requests {
            return false;
        }
        match self.last_request {
            Some(at) => now.duration_since(at) >= cooldown,
            None => true,
        }
    }

    fn load(&self) -> f64 {
        self.active_requests as f64 / self.bots.len().max(1) as f64
    }
}

struct PoolInner {
    groups: Vec<GroupState>,
    sessions: HashMap<usize, Arc<dyn PoolSession>>,
    bot_to_group: HashMap<usize, usize>,
    bot_retry_count: HashMap<usize, u32>,
    failed_proxies: HashSet<usize>,
    cursor: usize,
}

/// 每个组一个出口代理；会话按组划分并受组内并发与冷却约束
pub struct ProxyPool {
    max_requests_per_proxy: u32,
    request_cooldown: Duration,
    retry: common::model::config::RetryConfig,
    inner: Mutex<PoolInner>,
}

impl ProxyPool {
    pub fn new(urls: Vec<Option<String>>, config: &ProxyConfig) -> Self {
        let urls = if urls.is_empty() { vec![None] } else { urls };
        let groups = urls
            .into_iter()
            .enumerate()
            .map(|(id, url)| GroupState::new(id, url))
            .collect::<Vec<_>>();
        info!("Proxy pool created with {} groups", groups.len());
        ProxyPool {
            max_requests_per_proxy: config.max_requests_per_proxy,
            request_cooldown: Duration::from_millis(config.request_cooldown_ms),
            retry: config.retry.clone(),
            inner: Mutex::new(PoolInner {
                groups,
                sessions: HashMap::new(),
                bot_to_group: HashMap::new(),
                bot_retry_count: HashMap::new(),
                failed_proxies: HashSet::new(),
                cursor: 0,
            }),
        }
    }

    /// 从文件加载代理列表，空行跳过；文件不可读时退化为单个直连组
    pub fn load(config: &ProxyConfig) -> Self {
        let urls = match &config.file {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| {
                        if line.starts_with("http://") || line.starts_with("socks5://") {
                            Some(Some(line.to_string()))
                        } else {
                            warn!("Skipping proxy line with unsupported scheme: {}", line);
                            None
                        }
                    })
                    .collect(),
                Err(e) => {
                    warn!("Proxy file {} unreadable ({}), falling back to direct connection", path, e);
                    vec![None]
                }
            },
            None => vec![None],
        };
        Self::new(urls, config)
    }

    pub fn register_session(&self, session: Arc<dyn PoolSession>) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(session.id(), session);
    }

    /// 把已注册的会话按 ⌈B/G⌉ 顺序填充到各组
    ///
    /// 返回完整的 (session, proxy url) 分配表，变更由调用方应用到会话上。
    pub fn distribute(&self) -> Vec<(usize, Option<String>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids: Vec<usize> = inner.sessions.keys().copied().collect();
        ids.sort_unstable();

        let group_count = inner.groups.len();
        let per_group = ids.len().div_ceil(group_count.max(1));

        for group in inner.groups.iter_mut() {
            group.bots.clear();
        }
        inner.bot_to_group.clear();

        let mut assignments = Vec::with_capacity(ids.len());
        for (i, session) in ids.into_iter().enumerate() {
            let group = if per_group == 0 { 0 } else { (i / per_group).min(group_count - 1) };
            inner.groups[group].bots.push(session);
            inner.bot_to_group.insert(session, group);
            assignments.push((session, inner.groups[group].url.clone()));
        }
        assignments
    }

    /// 当前某会话绑定的组及其代理
    pub fn assignment(&self, session: usize) -> Option<(usize, Option<String>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .bot_to_group
            .get(&session)
            .map(|&g| (g, inner.groups[g].url.clone()))
    }

    /// 按策略选取一个可用会话并预留；同时登记组的请求计数
    pub fn acquire(&self, strategy: SelectionStrategy) -> Result<SessionLease> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let order: Vec<usize> = match strategy {
            SelectionStrategy::LeastLoaded => {
                let mut candidates: Vec<usize> = (0..inner.groups.len())
                    .filter(|&g| {
                        inner.groups[g].can_accept(self.max_requests_per_proxy, self.request_cooldown, now)
                            && self.has_available(&inner, g)
                    })
                    .collect();
                candidates.sort_by(|&a, &b| {
                    inner.groups[a]
                        .load()
                        .partial_cmp(&inner.groups[b].load())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                candidates
            }
            SelectionStrategy::RoundRobin => {
                let len = inner.groups.len();
                let start = inner.cursor;
                (0..len).map(|i| (start + i) % len).collect()
            }
        };

        for g in order {
            if !inner.groups[g].can_accept(self.max_requests_per_proxy, self.request_cooldown, now) {
                continue;
            }
            let claimed = inner.groups[g]
                .bots
                .iter()
                .copied()
                .find(|sid| {
                    inner
                        .sessions
                        .get(sid)
                        .map(|s| s.is_available() && s.try_reserve())
                        .unwrap_or(false)
                });
            if let Some(session) = claimed {
                let group = &mut inner.groups[g];
                group.active_requests += 1;
                group.total_requests += 1;
                group.last_request = Some(now);
                if strategy == SelectionStrategy::RoundRobin {
                    inner.cursor = (g + 1) % inner.groups.len();
                }
                counter!("proxy_pool_acquisitions_total", "group" => g.to_string()).increment(1);
                return Ok(SessionLease { group: g, session });
            }
        }

        Err(ProxyError::NoSessionAvailable.into())
    }

    fn has_available(&self, inner: &PoolInner, group: usize) -> bool {
        inner.groups[group]
            .bots
            .iter()
            .any(|sid| inner.sessions.get(sid).map(|s| s.is_available()).unwrap_or(false))
    }

    /// 归还租约；失败时计入组的失败数
    pub fn release(&self, lease: &SessionLease, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group) = inner.groups.get_mut(lease.group) {
            group.active_requests = group.active_requests.saturating_sub(1);
            if !success {
                group.failures += 1;
            }
        }
        if let Some(session) = inner.sessions.get(&lease.session) {
            session.release_reservation();
        }
    }

    pub fn on_login_success(&self, session: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&g) = inner.bot_to_group.get(&session) {
            inner.groups[g].successful_logins += 1;
        }
        inner.bot_retry_count.remove(&session);
    }

    /// 登录失败：登记失败、评估组健康、决定是否换组重试
    ///
    /// SteamGuard 误报不计入组健康评估。
    pub fn on_login_failure(&self, session: usize, reason: FailureReason) -> RetryDecision {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.bot_to_group.get(&session).copied();

        if let Some(g) = current {
            inner.groups[g].login_failures += 1;
            counter!("proxy_pool_login_failures_total", "reason" => reason.to_string()).increment(1);
            if reason != FailureReason::SteamGuard {
                let login_failures = inner.groups[g].login_failures;
                let success_rate = inner.groups[g].success_rate();
                if login_failures > FAILED_LOGIN_THRESHOLD
                    && success_rate < FAILED_SUCCESS_RATE
                    && inner.failed_proxies.insert(g)
                {
                    warn!(
                        "Proxy group {} marked failed ({} login failures, {:.2} success rate)",
                        g, login_failures, success_rate
                    );
                }
            }
        }

        let count = inner.bot_retry_count.get(&session).copied().unwrap_or(0);
        if !self.retry.enabled || count >= self.retry.max_retries {
            return RetryDecision::give_up(count);
        }
        let count = count + 1;
        inner.bot_retry_count.insert(session, count);

        let mut candidates: Vec<(usize, i32, usize)> = inner
            .groups
            .iter()
            .filter(|g| {
                Some(g.id) != current
                    && (!self.retry.exclude_failed || !inner.failed_proxies.contains(&g.id))
                    && (g.bots.len() as u32) < self.max_requests_per_proxy
            })
            .map(|g| (g.id, (g.success_rate() * 10.0).floor() as i32, g.bots.len()))
            .collect();
        // 成功率按 0.1 分桶降序，同桶内偏向小组
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let new_group = candidates.first().map(|c| c.0);
        if let Some(ng) = new_group {
            if let Some(g) = current {
                inner.groups[g].bots.retain(|&b| b != session);
            }
            inner.groups[ng].bots.push(session);
            inner.bot_to_group.insert(session, ng);
        }
        let new_proxy = new_group.and_then(|g| inner.groups[g].url.clone());

        let retry_delay = if reason == FailureReason::SteamGuard {
            STEAM_GUARD_RETRY_DELAY
        } else {
            Duration::from_millis(self.retry.retry_delay_ms)
        };

        RetryDecision {
            should_retry: true,
            new_group,
            new_proxy,
            retry_delay,
            retry_count: count,
        }
    }

    /// 全池并发上限：组数 × 每组并发
    pub fn max_concurrency(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.groups.len() * self.max_requests_per_proxy as usize
    }

    /// 队列出队前的入场检查：存在任何一个可接请求的组
    pub fn can_accept_more(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .groups
            .iter()
            .any(|g| g.can_accept(self.max_requests_per_proxy, self.request_cooldown, now))
    }

    pub fn group_count(&self) -> usize {
        self.inner.lock().unwrap().groups.len()
    }

    pub fn retry_count(&self, session: usize) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .bot_retry_count
            .get(&session)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            groups: inner
                .groups
                .iter()
                .map(|g| GroupStats {
                    id: g.id,
                    proxy: g.url.clone(),
                    bots: g.bots.len(),
                    active_requests: g.active_requests,
                    total_requests: g.total_requests,
                    failures: g.failures,
                    login_failures: g.login_failures,
                    successful_logins: g.successful_logins,
                    success_rate: g.success_rate(),
                    failed: inner.failed_proxies.contains(&g.id),
                })
                .collect(),
            failed_groups: inner.failed_proxies.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub groups: Vec<GroupStats>,
    pub failed_groups: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub id: usize,
    pub proxy: Option<String>,
    pub bots: usize,
    pub active_requests: u32,
    pub total_requests: u64,
    pub failures: u64,
    pub login_failures: u32,
    pub successful_logins: u32,
    pub success_rate: f32,
    pub failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubSession {
        id: usize,
        ready: AtomicBool,
        reserved: AtomicBool,
    }

    impl StubSession {
        fn new(id: usize) -> Arc<Self> {
            Arc::new(StubSession {
                id,
                ready: AtomicBool::new(true),
                reserved: AtomicBool::new(false),
            })
        }
    }

    impl PoolSession for StubSession {
        fn id(&self) -> usize {
            self.id
        }
        fn is_available(&self) -> bool {
            self.ready.load(Ordering::SeqCst) && !self.reserved.load(Ordering::SeqCst)
        }
        fn try_reserve(&self) -> bool {
            self.reserved
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }
        fn release_reservation(&self) {
            self.reserved.store(false, Ordering::SeqCst);
        }
    }

    fn pool_config(max_per_proxy: u32, cooldown_ms: u64) -> ProxyConfig {
        ProxyConfig {
            file: None,
            max_requests_per_proxy: max_per_proxy,
            request_cooldown_ms: cooldown_ms,
            strategy: SelectionStrategy::LeastLoaded,
            retry: Default::default(),
        }
    }

    fn make_pool(groups: usize, sessions: usize, config: &ProxyConfig) -> (ProxyPool, Vec<Arc<StubSession>>) {
        let urls = (0..groups)
            .map(|i| Some(format!("http://proxy{i}:8080")))
            .collect();
        let pool = ProxyPool::new(urls, config);
        let stubs: Vec<Arc<StubSession>> = (0..sessions).map(StubSession::new).collect();
        for stub in &stubs {
            pool.register_session(stub.clone());
        }
        pool.distribute();
        (pool, stubs)
    }

    #[test]
    fn test_distribution_is_ceil_fill() {
        let config = pool_config(10, 0);
        let (pool, _) = make_pool(2, 5, &config);
        let stats = pool.stats();
        // ⌈5/2⌉ = 3：前 3 个进第一组，其余进第二组
        assert_eq!(stats.groups[0].bots, 3);
        assert_eq!(stats.groups[1].bots, 2);
        assert_eq!(pool.assignment(0).unwrap().0, 0);
        assert_eq!(pool.assignment(4).unwrap().0, 1);
    }

    #[test]
    fn test_acquire_respects_admission() {
        let config = pool_config(1, 0);
        let (pool, _) = make_pool(1, 2, &config);

        let lease = pool.acquire(SelectionStrategy::LeastLoaded).unwrap();
        // activeRequests == maxRequestsPerProxy，该组不再接单
        assert!(pool.acquire(SelectionStrategy::LeastLoaded).is_err());
        pool.release(&lease, true);
        assert!(pool.acquire(SelectionStrategy::LeastLoaded).is_ok());
    }

    #[test]
    fn test_acquire_respects_cooldown() {
        let config = pool_config(5, 60_000);
        let (pool, _) = make_pool(1, 2, &config);

        let _lease = pool.acquire(SelectionStrategy::LeastLoaded).unwrap();
        assert!(pool.acquire(SelectionStrategy::LeastLoaded).is_err());
        assert!(!pool.can_accept_more());
    }

    #[test]
    fn test_least_loaded_picks_emptier_group() {
        let config = pool_config(10, 0);
        let (pool, _) = make_pool(2, 4, &config);

        let first = pool.acquire(SelectionStrategy::LeastLoaded).unwrap();
        let second = pool.acquire(SelectionStrategy::LeastLoaded).unwrap();
        assert_ne!(first.group, second.group);
    }

    #[test]
    fn test_round_robin_advances_cursor() {
        let config = pool_config(10, 0);
        let (pool, _) = make_pool(2, 4, &config);

        let first = pool.acquire(SelectionStrategy::RoundRobin).unwrap();
        let second = pool.acquire(SelectionStrategy::RoundRobin).unwrap();
        assert_eq!(first.group, 0);
        assert_eq!(second.group, 1);
    }

    #[test]
    fn test_acquire_reserves_session() {
        let config = pool_config(10, 0);
        let (pool, stubs) = make_pool(1, 1, &config);

        let lease = pool.acquire(SelectionStrategy::LeastLoaded).unwrap();
        assert!(!stubs[0].is_available());
        assert!(pool.acquire(SelectionStrategy::LeastLoaded).is_err());
        pool.release(&lease, false);
        assert!(stubs[0].is_available());
        assert_eq!(pool.stats().groups[0].failures, 1);
    }

    #[test]
    fn test_steam_guard_reassigns_without_health_charge() {
        let config = pool_config(10, 0);
        let (pool, _) = make_pool(2, 2, &config);
        let origin = pool.assignment(0).unwrap().0;

        let decision = pool.on_login_failure(0, FailureReason::SteamGuard);
        assert!(decision.should_retry);
        assert_eq!(decision.retry_count, 1);
        assert_eq!(decision.retry_delay, STEAM_GUARD_RETRY_DELAY);
        let new_group = decision.new_group.unwrap();
        assert_ne!(new_group, origin);

        let stats = pool.stats();
        assert_eq!(stats.groups[origin].login_failures, 1);
        // successRate 分子不变：0 仍是 0
        assert_eq!(stats.groups[origin].success_rate, 0.0);
        assert!(!stats.groups[origin].failed);
        assert_eq!(pool.retry_count(0), 1);
    }

    #[test]
    fn test_retry_disabled_gives_up() {
        let mut config = pool_config(10, 0);
        config.retry.enabled = false;
        let (pool, _) = make_pool(2, 2, &config);

        let decision = pool.on_login_failure(0, FailureReason::Proxy);
        assert!(!decision.should_retry);
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut config = pool_config(10, 0);
        config.retry.max_retries = 2;
        let (pool, _) = make_pool(3, 3, &config);

        assert!(pool.on_login_failure(0, FailureReason::Proxy).should_retry);
        assert!(pool.on_login_failure(0, FailureReason::Proxy).should_retry);
        let third = pool.on_login_failure(0, FailureReason::Proxy);
        assert!(!third.should_retry);
        assert_eq!(third.retry_count, 2);
    }

    #[test]
    fn test_login_success_clears_retry_count() {
        let config = pool_config(10, 0);
        let (pool, _) = make_pool(2, 2, &config);

        pool.on_login_failure(0, FailureReason::Proxy);
        assert_eq!(pool.retry_count(0), 1);
        pool.on_login_success(0);
        assert_eq!(pool.retry_count(0), 0);
        let group = pool.assignment(0).unwrap().0;
        assert_eq!(pool.stats().groups[group].successful_logins, 1);
    }

    #[test]
    fn test_group_marked_failed_after_repeated_failures() {
        let mut config = pool_config(10, 0);
        config.retry.max_retries = 100;
        config.retry.exclude_failed = true;
        let urls = vec![Some("http://proxy0:8080".to_string())];
        let pool = ProxyPool::new(urls, &config);
        let stub = StubSession::new(0);
        pool.register_session(stub);
        pool.distribute();

        for _ in 0..6 {
            pool.on_login_failure(0, FailureReason::Proxy);
        }
        let stats = pool.stats();
        assert!(stats.groups[0].failed);
        assert_eq!(stats.failed_groups, 1);
    }

    #[test]
    fn test_fallback_pool_has_single_direct_group() {
        let mut config = pool_config(3, 0);
        config.file = Some("/nonexistent/proxies.txt".to_string());
        let pool = ProxyPool::load(&config);
        assert_eq!(pool.group_count(), 1);
        assert!(pool.stats().groups[0].proxy.is_none());
        assert_eq!(pool.max_concurrency(), 3);
    }
}
