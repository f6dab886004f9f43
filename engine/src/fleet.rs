use common::model::account::Account;
use common::model::events::{FailureReason, SessionEvent};
use errors::{ApiError, Result};
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use proxy::{PoolSession, ProxyPool};
use serde::Serialize;
use session::{SessionSettings, SteamSession, TransportFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};

/// 首批登录按 3 个一组，组间隔 3 秒
const LOGIN_CHUNK_SIZE: usize = 3;
const LOGIN_CHUNK_GAP: Duration = Duration::from_secs(3);
/// 维护循环周期
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// 会话掉线后延迟复查
const UNREADY_RECHECK_DELAY: Duration = Duration::from_secs(5);

/// 登录失败原因对应的重试延迟表
fn login_retry_delay(reason: FailureReason, retry_count: u32, policy_default: Duration) -> Duration {
    match reason {
        FailureReason::SteamGuard => Duration::from_secs(15),
        FailureReason::Proxy => Duration::from_secs(10),
        FailureReason::RateLimit => {
            let n = retry_count.max(1);
            let backoff = 30u64.saturating_mul(1u64 << (n - 1).min(6));
            Duration::from_secs(backoff.min(120))
        }
        _ => policy_default,
    }
}

/// 池侧的会话视图
pub(crate) struct PooledSteam(Arc<SteamSession>);

impl PooledSteam {
    pub(crate) fn new(session: Arc<SteamSession>) -> Self {
        PooledSteam(session)
    }
}

impl PoolSession for PooledSteam {
    fn id(&self) -> usize {
        self.0.id()
    }
    fn is_available(&self) -> bool {
        self.0.is_available()
    }
    fn try_reserve(&self) -> bool {
        self.0.try_reserve()
    }
    fn release_reservation(&self) {
        self.0.release_reservation()
    }
}

#[derive(Debug, Clone)]
pub struct FailedAccount {
    pub reason: String,
    pub since: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingAuth {
    pub session: usize,
    pub since: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingAuthView {
    pub username: String,
    pub session: usize,
    pub waiting_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub online: usize,
    pub target: usize,
    pub total: usize,
    pub busy: usize,
    pub failed: usize,
    pub spares: usize,
    #[serde(rename = "queuedSpares")]
    pub queued_spares: usize,
    #[serde(rename = "pendingAuth")]
    pub pending_auth: usize,
    pub status: &'static str,
}

/// 会话舰队监督器
///
/// 维持目标在线数：首批账号分块拉起，终止性失败的账号换备用号顶上，
/// 备用号按固定间隔错峰激活。所有会话生命周期事件经同一条通道进来。
pub struct Fleet {
    weak: Weak<Fleet>,
    settings: SessionSettings,
    max_online: usize,
    spare_delay: Duration,
    retry_default: Duration,
    factory: Arc<dyn TransportFactory>,
    pool: Option<Arc<ProxyPool>>,
    sessions: RwLock<Vec<Arc<SteamSession>>>,
    initial_accounts: Mutex<Vec<Account>>,
    spare_accounts: Mutex<Vec<Account>>,
    spare_queue: Mutex<VecDeque<Account>>,
    spare_queue_busy: AtomicBool,
    failed_accounts: Mutex<HashMap<String, FailedAccount>>,
    pending_auth: Mutex<HashMap<String, PendingAuth>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    ready_watch: watch::Sender<bool>,
}

impl Fleet {
    pub fn new(
        accounts: Vec<Account>,
        max_online: usize,
        spare_delay: Duration,
        retry_default: Duration,
        settings: SessionSettings,
        factory: Arc<dyn TransportFactory>,
        pool: Option<Arc<ProxyPool>>,
    ) -> Arc<Self> {
        let split = max_online.min(accounts.len());
        let mut accounts = accounts;
        let spare_accounts = accounts.split_off(split);
        if !spare_accounts.is_empty() {
            info!(
                "Loaded {} initial accounts, {} spares",
                accounts.len(),
                spare_accounts.len()
            );
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_watch, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Fleet {
            weak: weak.clone(),
            settings,
            max_online,
            spare_delay,
            retry_default,
            factory,
            pool,
            sessions: RwLock::new(Vec::new()),
            initial_accounts: Mutex::new(accounts),
            spare_accounts: Mutex::new(spare_accounts),
            spare_queue: Mutex::new(VecDeque::new()),
            spare_queue_busy: AtomicBool::new(false),
            failed_accounts: Mutex::new(HashMap::new()),
            pending_auth: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            ready_watch,
        })
    }

    /// 事件循环、维护循环与首批登录一起启动
    pub fn start(&self, shutdown: &broadcast::Sender<()>) {
        let mut rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("fleet already started");

        let fleet = match self.weak.upgrade() {
            Some(fleet) => fleet,
            None => return,
        };
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = rx.recv() => match event {
                        Some(event) => fleet.handle_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Fleet event loop stopped");
        });

        let fleet = match self.weak.upgrade() {
            Some(fleet) => fleet,
            None => return,
        };
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => fleet.check_and_maintain().await,
                }
            }
        });

        let fleet = match self.weak.upgrade() {
            Some(fleet) => fleet,
            None => return,
        };
        tokio::spawn(async move {
            fleet.bootstrap().await;
        });
    }

    /// 首批登录：3 个一组，组间 3 秒，每组之后重新分布代理
    async fn bootstrap(&self) {
        let initial = std::mem::take(&mut *self.initial_accounts.lock().unwrap());
        let chunks: Vec<Vec<Account>> = initial
            .chunks(LOGIN_CHUNK_SIZE)
            .map(|c| c.to_vec())
            .collect();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut spawned = Vec::with_capacity(chunk.len());
            for account in chunk {
                spawned.push(self.spawn_session(account).await);
            }
            if self.pool.is_some() {
                self.redistribute().await;
            }
            for session in spawned {
                let _ = session.log_in(None).await;
            }
            if i != last {
                tokio::time::sleep(LOGIN_CHUNK_GAP).await;
            }
        }
    }

    /// 创建会话并注册进池；监听在登录之前就已挂好
    async fn spawn_session(&self, account: Account) -> Arc<SteamSession> {
        let id = self.sessions.read().unwrap().len();
        info!("Creating session {} for {}", id, account.username);
        let session = SteamSession::new(
            id,
            account,
            self.settings.clone(),
            self.factory.clone(),
            self.events_tx.clone(),
            None,
        );
        if let Some(pool) = &self.pool {
            pool.register_session(Arc::new(PooledSteam::new(session.clone())));
        }
        self.sessions.write().unwrap().push(session.clone());
        session.start_relogin_timer();
        gauge!("fleet_sessions_total").set(self.total() as f64);
        session
    }

    /// 重新计算分布，只对换了组的会话做换绑
    async fn redistribute(&self) {
        let Some(pool) = &self.pool else { return };
        let assignments = pool.distribute();
        let sessions: Vec<Arc<SteamSession>> = self.sessions.read().unwrap().clone();
        for (id, url) in assignments {
            if let Some(session) = sessions.get(id)
                && session.proxy_url() != url
            {
                let _ = session.update_proxy(url).await;
            }
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Ready { session } => {
                debug!("Session {} ready", session);
                if self.ready_count() == 1 {
                    info!("Fleet ready");
                    let _ = self.ready_watch.send(true);
                }
                gauge!("fleet_sessions_ready").set(self.ready_count() as f64);
            }
            SessionEvent::Unready { session } => {
                if self.ready_count() == 0 {
                    warn!("Fleet has no ready sessions");
                    let _ = self.ready_watch.send(false);
                }
                gauge!("fleet_sessions_ready").set(self.ready_count() as f64);
                if let Some(fleet) = self.weak.upgrade() {
                    tokio::spawn(async move {
                        tokio::time::sleep(UNREADY_RECHECK_DELAY).await;
                        fleet.check_and_maintain().await;
                    });
                }
                debug!("Session {} unready", session);
            }
            SessionEvent::LoginSuccess { session, username } => {
                if let Some(pool) = &self.pool {
                    pool.on_login_success(session);
                }
                self.pending_auth.lock().unwrap().remove(&username);
            }
            SessionEvent::LoginFailed {
                session,
                username,
                reason,
                message,
            } => {
                self.handle_login_failure(session, username, reason, message)
                    .await;
            }
            SessionEvent::AuthFailed {
                session,
                username,
                message,
            } => {
                error!(
                    "Session {} auth failed for {}: {}",
                    session, username, message
                );
                counter!("fleet_auth_failures_total").increment(1);
                self.mark_account_failed(&username, &message);
                self.try_spare_account();
            }
            SessionEvent::CodeRequired { session, username } => {
                warn!(
                    "Session {} requires an interactive auth code for {}",
                    session, username
                );
                self.pending_auth.lock().unwrap().insert(
                    username,
                    PendingAuth {
                        session,
                        since: Instant::now(),
                    },
                );
            }
        }
    }

    async fn handle_login_failure(
        &self,
        session: usize,
        username: String,
        reason: FailureReason,
        message: String,
    ) {
        warn!(
            "Session {} login failed ({}): {}",
            session, reason, message
        );
        counter!("fleet_login_failures_total", "reason" => reason.to_string()).increment(1);

        let decision = match &self.pool {
            Some(pool) => pool.on_login_failure(session, reason),
            None => proxy::RetryDecision {
                should_retry: true,
                new_group: None,
                new_proxy: None,
                retry_delay: self.retry_default,
                retry_count: 0,
            },
        };

        if !decision.should_retry {
            error!(
                "Session {} exhausted login retries, retiring {}",
                session, username
            );
            self.mark_account_failed(&username, &format!("login retries exhausted: {message}"));
            self.try_spare_account();
            return;
        }

        let delay = login_retry_delay(reason, decision.retry_count, decision.retry_delay);
        let Some(target) = self.session(session) else {
            return;
        };
        let rebind = decision.new_group.is_some();
        let new_proxy = decision.new_proxy.clone();
        info!(
            "Session {} retrying login in {:?} (attempt {}, group {:?})",
            session, delay, decision.retry_count, decision.new_group
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if rebind {
                let _ = target.update_proxy(new_proxy).await;
            }
            let _ = target.log_in(None).await;
        });
    }

    fn mark_account_failed(&self, username: &str, reason: &str) {
        self.failed_accounts.lock().unwrap().insert(
            username.to_string(),
            FailedAccount {
                reason: reason.to_string(),
                since: Instant::now(),
            },
        );
    }

    /// 把一个备用号排进激活队列；真正的登录由排水器按间隔做
    fn try_spare_account(&self) {
        let account = {
            let mut spares = self.spare_accounts.lock().unwrap();
            if spares.is_empty() {
                warn!("No spare accounts left to activate");
                return;
            }
            spares.remove(0)
        };
        info!("Queueing spare account {}", account.username);
        self.spare_queue.lock().unwrap().push_back(account);
        self.ensure_spare_drainer();
    }

    /// 单例排水器：每 spare_delay 激活一个，目标达成即丢弃剩余队列
    fn ensure_spare_drainer(&self) {
        if self.spare_queue_busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let fleet = match self.weak.upgrade() {
            Some(fleet) => fleet,
            None => return,
        };
        tokio::spawn(async move {
            loop {
                if fleet.ready_count() >= fleet.max_online {
                    let flushed = {
                        let mut queue = fleet.spare_queue.lock().unwrap();
                        let flushed = queue.len();
                        queue.clear();
                        flushed
                    };
                    if flushed > 0 {
                        info!("Target reached, dropped {} queued spares", flushed);
                    }
                    break;
                }
                let Some(account) = fleet.spare_queue.lock().unwrap().pop_front() else {
                    break;
                };
                info!("Activating spare account {}", account.username);
                let session = fleet.spawn_session(account).await;
                if fleet.pool.is_some() {
                    fleet.redistribute().await;
                }
                let _ = session.log_in(None).await;
                tokio::time::sleep(fleet.spare_delay).await;
            }
            fleet.spare_queue_busy.store(false, Ordering::SeqCst);
            // 排水期间新入队的账号由下一轮接手
            if !fleet.spare_queue.lock().unwrap().is_empty() {
                fleet.ensure_spare_drainer();
            }
        });
    }

    /// 维护循环：按在线缺口补备用号
    pub async fn check_and_maintain(&self) {
        let ready = self.ready_count();
        let queued = self.spare_queue.lock().unwrap().len();
        let needed = self.max_online.saturating_sub(ready + queued);
        if needed == 0 {
            return;
        }
        let mut moved = 0;
        {
            let mut spares = self.spare_accounts.lock().unwrap();
            let mut queue = self.spare_queue.lock().unwrap();
            for _ in 0..needed {
                if spares.is_empty() {
                    break;
                }
                queue.push_back(spares.remove(0));
                moved += 1;
            }
        }
        if moved > 0 {
            debug!(
                "Maintenance queued {} spares (ready {}, target {})",
                moved, ready, self.max_online
            );
            self.ensure_spare_drainer();
        }
    }

    /// 操作员提交验证码，重试挂起的登录
    pub async fn submit_auth_code(&self, username: &str, code: &str) -> Result<()> {
        let pending = self
            .pending_auth
            .lock()
            .unwrap()
            .get(username)
            .copied()
            .ok_or_else(|| ApiError::PendingAuthNotFound(username.to_string()))?;
        let session = self
            .session(pending.session)
            .ok_or_else(|| ApiError::PendingAuthNotFound(username.to_string()))?;
        // 成功后 LoginSuccess 会清掉挂起条目
        session.log_in(Some(code.to_string())).await
    }

    pub fn session(&self, id: usize) -> Option<Arc<SteamSession>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// 无池部署的直连选取：预留第一个可用会话
    pub fn reserve_any(&self) -> Option<Arc<SteamSession>> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .iter()
            .find(|s| s.is_available() && s.try_reserve())
            .cloned()
    }

    pub fn ready_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.is_ready())
            .count()
    }

    pub fn busy_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.is_busy())
            .count()
    }

    pub fn total(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn spare_count(&self) -> usize {
        self.spare_accounts.lock().unwrap().len()
    }

    pub fn queued_spare_count(&self) -> usize {
        self.spare_queue.lock().unwrap().len()
    }

    pub fn pending_auth_count(&self) -> usize {
        self.pending_auth.lock().unwrap().len()
    }

    pub fn pending_auth_views(&self) -> Vec<PendingAuthView> {
        self.pending_auth
            .lock()
            .unwrap()
            .iter()
            .map(|(username, pending)| PendingAuthView {
                username: username.clone(),
                session: pending.session,
                waiting_secs: pending.since.elapsed().as_secs(),
            })
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_accounts.lock().unwrap().len()
    }

    pub fn ready_changes(&self) -> watch::Receiver<bool> {
        self.ready_watch.subscribe()
    }

    pub fn status(&self) -> FleetStatus {
        let online = self.ready_count();
        let status = if online == 0 {
            "degraded"
        } else if online >= self.max_online {
            "optimal"
        } else {
            "recovering"
        };
        FleetStatus {
            online,
            target: self.max_online,
            total: self.total(),
            busy: self.busy_count(),
            failed: self.failed_count(),
            spares: self.spare_count(),
            queued_spares: self.queued_spare_count(),
            pending_auth: self.pending_auth_count(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::config::ProxyConfig;
    use session::TransportEvent;
    use session::mock::{MockBehavior, MockFactory};

    fn accounts(names: &[&str]) -> Vec<Account> {
        names.iter().map(|n| Account::new(*n, "pw")).collect()
    }

    fn fleet_with(
        factory: Arc<MockFactory>,
        names: &[&str],
        max_online: usize,
        pool: Option<Arc<ProxyPool>>,
    ) -> (Arc<Fleet>, broadcast::Sender<()>) {
        let fleet = Fleet::new(
            accounts(names),
            max_online,
            Duration::from_secs(5),
            Duration::from_secs(5),
            SessionSettings::default(),
            factory,
            pool,
        );
        let (shutdown, _) = broadcast::channel(1);
        fleet.start(&shutdown);
        (fleet, shutdown)
    }

    async fn wait_ready(fleet: &Arc<Fleet>, count: usize) {
        for _ in 0..2000 {
            if fleet.ready_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fleet never reached {} ready sessions", count);
    }

    #[test]
    fn test_retry_delay_table() {
        let default = Duration::from_secs(5);
        assert_eq!(
            login_retry_delay(FailureReason::SteamGuard, 1, default),
            Duration::from_secs(15)
        );
        assert_eq!(
            login_retry_delay(FailureReason::Proxy, 1, default),
            Duration::from_secs(10)
        );
        assert_eq!(
            login_retry_delay(FailureReason::RateLimit, 1, default),
            Duration::from_secs(30)
        );
        assert_eq!(
            login_retry_delay(FailureReason::RateLimit, 2, default),
            Duration::from_secs(60)
        );
        // 上限 120 秒
        assert_eq!(
            login_retry_delay(FailureReason::RateLimit, 5, default),
            Duration::from_secs(120)
        );
        assert_eq!(login_retry_delay(FailureReason::Other, 1, default), default);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_splits_spares() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (fleet, _shutdown) = fleet_with(factory, &["a", "b", "c", "d"], 2, None);
        wait_ready(&fleet, 2).await;

        assert_eq!(fleet.total(), 2);
        assert_eq!(fleet.spare_count(), 2);
        assert_eq!(fleet.status().status, "optimal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_promotes_one_spare_with_stagger() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (fleet, _shutdown) =
            fleet_with(factory.clone(), &["a", "b", "c", "d", "e", "f"], 3, None);
        wait_ready(&fleet, 3).await;
        assert_eq!(fleet.spare_count(), 3);

        // 账号 a 终止性失败
        factory.emit(
            0,
            TransportEvent::LogonFailed {
                eresult: Some(61),
                message: "invalid password".to_string(),
            },
        );
        for _ in 0..2000 {
            if fleet.total() == 4 && fleet.ready_count() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(fleet.total(), 4);
        assert_eq!(fleet.spare_count(), 2);
        assert_eq!(fleet.failed_count(), 1);
        // 只激活一个备用号，目标达成后队列清空
        assert_eq!(fleet.queued_spare_count(), 0);
        assert_eq!(fleet.status().status, "optimal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_degraded_without_sessions() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let fleet = Fleet::new(
            accounts(&["a"]),
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            SessionSettings::default(),
            factory,
            None,
        );
        assert_eq!(fleet.status().status, "degraded");
        assert_eq!(fleet.status().target, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_distribution_applies_proxies() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let config = ProxyConfig {
            file: None,
            max_requests_per_proxy: 5,
            request_cooldown_ms: 0,
            strategy: Default::default(),
            retry: Default::default(),
        };
        let pool = Arc::new(ProxyPool::new(
            vec![
                Some("http://proxy0:8080".to_string()),
                Some("http://proxy1:8080".to_string()),
            ],
            &config,
        ));
        let (fleet, _shutdown) =
            fleet_with(factory.clone(), &["a", "b", "c", "d"], 4, Some(pool.clone()));
        wait_ready(&fleet, 4).await;

        // ⌈4/2⌉ = 每组 2 个
        let s0 = fleet.session(0).unwrap();
        let s3 = fleet.session(3).unwrap();
        assert_eq!(s0.proxy_url().as_deref(), Some("http://proxy0:8080"));
        assert_eq!(s3.proxy_url().as_deref(), Some("http://proxy1:8080"));
        assert_eq!(pool.assignment(0).unwrap().0, 0);
        assert_eq!(pool.assignment(3).unwrap().0, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_auth_flow() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (fleet, _shutdown) = fleet_with(factory.clone(), &["a"], 1, None);
        wait_ready(&fleet, 1).await;

        factory.emit(0, TransportEvent::CodeRequired);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fleet.pending_auth_count(), 1);
        assert_eq!(fleet.pending_auth_views()[0].username, "a");

        fleet.submit_auth_code("a", "R2D2C").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // LoginSuccess 清掉挂起条目
        assert_eq!(fleet.pending_auth_count(), 0);

        let err = fleet.submit_auth_code("nobody", "X").await.unwrap_err();
        assert!(err.is_api());
    }
}
