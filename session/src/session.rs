use crate::classify::classify_login_failure;
use crate::totp;
use crate::transport::{Credentials, Transport, TransportEvent, TransportFactory};
use common::model::account::{Account, AuthSecret};
use common::model::events::{FailureReason, SessionEvent};
use common::model::inspect::InspectLink;
use common::model::item::{ItemData, RawItem};
use errors::{Result, SessionError};
use log::{debug, info, warn};
use metrics::counter;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

const GAME_APP_ID: u32 = 730;
/// 定期重登：30 分钟加 0–4 分钟抖动
const RELOGIN_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RELOGIN_JITTER_SECS: u64 = 240;

/// 就绪状态机
///
/// NEW → CONNECTING → LOGGED_ON → (无游戏时 LICENSE_REQUESTED) →
/// GC_CONNECTING → READY ⇄ GC_DISCONNECTED；任何错误 → DISCONNECTED。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    New,
    Connecting,
    LoggedOn,
    LicenseRequested,
    GcConnecting,
    Ready,
    GcDisconnected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// 回包后的发包间隔，busy 保持到间隔结束
    pub request_delay: Duration,
    /// 单次检视的等待上限
    pub request_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            request_delay: Duration::from_millis(1100),
            request_ttl: Duration::from_millis(3000),
        }
    }
}

struct CurrentRequest {
    asset_id: String,
    issued: Instant,
    resolve: Option<oneshot::Sender<(ItemData, Duration)>>,
}

/// 一个绑定账号的上游会话
///
/// busy 的所有写入都持有 current 锁，保证 busy ⇒ current ≠ None。
pub struct SteamSession {
    weak: Weak<SteamSession>,
    id: usize,
    account: Account,
    settings: SessionSettings,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<ReadyState>,
    ready: AtomicBool,
    busy: AtomicBool,
    /// 调度器在池锁内预留会话，防止同一会话被发两单
    reserved: AtomicBool,
    relogin: AtomicBool,
    proxy_url: Mutex<Option<String>>,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    current: Mutex<Option<CurrentRequest>>,
}

impl SteamSession {
    pub fn new(
        id: usize,
        account: Account,
        settings: SessionSettings,
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<SessionEvent>,
        proxy_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| SteamSession {
            weak: weak.clone(),
            id,
            account,
            settings,
            factory,
            events,
            state: Mutex::new(ReadyState::New),
            ready: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            reserved: AtomicBool::new(false),
            relogin: AtomicBool::new(false),
            proxy_url: Mutex::new(proxy_url),
            transport: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.account.username
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_url.lock().unwrap().clone()
    }

    pub fn is_available(&self) -> bool {
        self.is_ready() && !self.is_busy() && !self.reserved.load(Ordering::SeqCst)
    }

    pub fn try_reserve(&self) -> bool {
        self.reserved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_reservation(&self) {
        self.reserved.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ReadyState) {
        *self.state.lock().unwrap() = state;
    }

    /// 派生二步验证码：显式传入的码优先；≤5 字符的密钥按原样发送，
    /// 更长的按共享密钥派生时间码
    fn two_factor_code(&self, code: Option<String>) -> Result<Option<String>> {
        if code.is_some() {
            return Ok(code);
        }
        match self.account.secret_kind() {
            AuthSecret::None => Ok(None),
            AuthSecret::Static => Ok(self.account.auth_secret.clone()),
            AuthSecret::Shared => {
                let secret = self.account.auth_secret.as_deref().unwrap_or_default();
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                Ok(Some(totp::generate_auth_code(secret, now)?))
            }
        }
    }

    async fn ensure_transport(
        &self,
        guard: &mut Option<Box<dyn Transport>>,
    ) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = self.proxy_url();
        let transport = self.factory.create(proxy.as_deref(), tx)?;
        *guard = Some(transport);
        self.spawn_event_pump(rx);
        Ok(())
    }

    /// 发起登录；结果通过生命周期事件返回
    pub async fn log_in(&self, code: Option<String>) -> Result<()> {
        let two_factor_code = self.two_factor_code(code)?;
        if self.ready.swap(false, Ordering::SeqCst) {
            self.emit(SessionEvent::Unready { session: self.id });
        }
        self.set_state(ReadyState::Connecting);

        let mut transport = self.transport.lock().await;
        self.ensure_transport(&mut transport).await?;
        let t = transport.as_mut().unwrap();

        let credentials = Credentials {
            username: self.account.username.clone(),
            password: self.account.password.clone(),
            two_factor_code,
        };

        if let Err(e) = t.connect().await {
            drop(transport);
            self.fail_login(None, &e.to_string());
            return Err(e);
        }
        if let Err(e) = t.log_on(&credentials).await {
            drop(transport);
            self.fail_login(None, &e.to_string());
            return Err(e);
        }
        Ok(())
    }

    fn fail_login(&self, eresult: Option<i32>, message: &str) {
        self.set_state(ReadyState::Disconnected);
        let reason = classify_login_failure(eresult, message);
        if reason == FailureReason::Auth {
            self.emit(SessionEvent::AuthFailed {
                session: self.id,
                username: self.account.username.clone(),
                message: message.to_string(),
            });
        } else {
            self.emit(SessionEvent::LoginFailed {
                session: self.id,
                username: self.account.username.clone(),
                reason,
                message: message.to_string(),
            });
        }
    }

    /// 仅在 ready ∧ ¬busy 时有效；发出后 busy 保持到回包加间隔结束
    pub async fn inspect(&self, link: &InspectLink) -> Result<(ItemData, Duration)> {
        let rx = {
            let mut current = self.current.lock().unwrap();
            if !self.is_ready() {
                return Err(SessionError::NotReady.into());
            }
            if self.busy.load(Ordering::SeqCst) {
                return Err(SessionError::Busy.into());
            }
            let (tx, rx) = oneshot::channel();
            *current = Some(CurrentRequest {
                asset_id: link.a.clone(),
                issued: Instant::now(),
                resolve: Some(tx),
            });
            self.busy.store(true, Ordering::SeqCst);
            rx
        };

        let sent = {
            let mut transport = self.transport.lock().await;
            match transport.as_mut() {
                Some(t) => t.send_inspect(link.owner(), &link.a, &link.d).await,
                None => Err(SessionError::NotReady.into()),
            }
        };
        if let Err(e) = sent {
            self.abort_inflight();
            return Err(e);
        }
        counter!("session_inspects_total", "session" => self.id.to_string()).increment(1);

        match tokio::time::timeout(self.settings.request_ttl, rx).await {
            Ok(Ok(done)) => Ok(done),
            Ok(Err(_)) => {
                self.abort_inflight();
                Err(SessionError::Disconnected("transport dropped in-flight inspect".into()).into())
            }
            Err(_) => {
                counter!("session_inspect_ttl_total").increment(1);
                self.abort_inflight();
                Err(SessionError::TtlExceeded.into())
            }
        }
    }

    fn abort_inflight(&self) {
        let mut current = self.current.lock().unwrap();
        self.busy.store(false, Ordering::SeqCst);
        *current = None;
    }

    fn complete_inspect(&self, raw: RawItem) {
        let (resolve, issued) = {
            let mut current = self.current.lock().unwrap();
            match current.as_mut() {
                Some(req) if req.asset_id == raw.itemid.to_string() => {
                    (req.resolve.take(), req.issued)
                }
                _ => {
                    // 与在途请求不匹配的回包静默丢弃
                    counter!("session_replies_dropped_total").increment(1);
                    return;
                }
            }
        };

        let delay = self.settings.request_delay.saturating_sub(issued.elapsed());
        let item = ItemData::from(raw);
        if let Some(tx) = resolve {
            let _ = tx.send((item, delay));
        }

        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = weak.upgrade() {
                session.abort_inflight();
            }
        });
    }

    /// 换绑代理：拆掉旧传输层，按新代理重建并重挂事件泵
    pub async fn update_proxy(&self, url: Option<String>) -> Result<()> {
        {
            *self.proxy_url.lock().unwrap() = url;
        }
        let mut transport = self.transport.lock().await;
        if let Some(t) = transport.as_mut() {
            let _ = t.log_off().await;
        }
        *transport = None;
        if self.ready.swap(false, Ordering::SeqCst) {
            self.emit(SessionEvent::Unready { session: self.id });
        }
        self.set_state(ReadyState::Disconnected);
        self.abort_inflight();
        self.ensure_transport(&mut transport).await
    }

    fn spawn_event_pump(&self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.handle_transport_event(event).await;
            }
        });
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                debug!("Session {} transport connected", self.id);
            }
            TransportEvent::LoggedOn { owns_game } => {
                self.set_state(ReadyState::LoggedOn);
                info!("Session {} logged on as {}", self.id, self.account.username);
                self.emit(SessionEvent::LoginSuccess {
                    session: self.id,
                    username: self.account.username.clone(),
                });
                // 重登周期跳过所有权检查
                let relogin = self.relogin.swap(false, Ordering::SeqCst);
                let mut transport = self.transport.lock().await;
                if let Some(t) = transport.as_mut() {
                    if !owns_game && !relogin {
                        self.set_state(ReadyState::LicenseRequested);
                        if let Err(e) = t.request_license(GAME_APP_ID).await {
                            warn!("Session {} license request failed: {}", self.id, e);
                        }
                    }
                    // 先清空再上报，迫使 GC 握手
                    self.set_state(ReadyState::GcConnecting);
                    let _ = t.set_games_played(&[]).await;
                    let _ = t.set_games_played(&[GAME_APP_ID]).await;
                }
            }
            TransportEvent::GcConnected => {
                self.set_state(ReadyState::Ready);
                if !self.ready.swap(true, Ordering::SeqCst) {
                    info!("Session {} ready", self.id);
                    self.emit(SessionEvent::Ready { session: self.id });
                }
            }
            TransportEvent::GcDisconnected => {
                self.set_state(ReadyState::GcDisconnected);
                if self.ready.swap(false, Ordering::SeqCst) {
                    warn!("Session {} lost game coordinator", self.id);
                    self.emit(SessionEvent::Unready { session: self.id });
                }
            }
            TransportEvent::InspectReply(raw) => {
                self.complete_inspect(raw);
            }
            TransportEvent::CodeRequired => {
                self.emit(SessionEvent::CodeRequired {
                    session: self.id,
                    username: self.account.username.clone(),
                });
            }
            TransportEvent::LogonFailed { eresult, message }
            | TransportEvent::Disconnected { eresult, message } => {
                if self.ready.swap(false, Ordering::SeqCst) {
                    self.emit(SessionEvent::Unready { session: self.id });
                }
                self.abort_inflight();
                self.fail_login(eresult, &message);
            }
        }
    }

    /// 周期性重登；仅当 GC 会话存在时执行
    pub fn start_relogin_timer(&self) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            loop {
                let jitter = Duration::from_secs(rand::rng().random_range(0..RELOGIN_JITTER_SECS));
                tokio::time::sleep(RELOGIN_INTERVAL + jitter).await;
                let Some(session) = weak.upgrade() else { break };
                if session.state() != ReadyState::Ready {
                    continue;
                }
                info!("Session {} scheduled relogin", session.id);
                session.relogin.store(true, Ordering::SeqCst);
                {
                    let mut transport = session.transport.lock().await;
                    if let Some(t) = transport.as_mut() {
                        let _ = t.log_off().await;
                    }
                }
                let _ = session.log_in(None).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockFactory};
    use tokio::sync::mpsc::unbounded_channel;

    fn settings(delay_ms: u64, ttl_ms: u64) -> SessionSettings {
        SessionSettings {
            request_delay: Duration::from_millis(delay_ms),
            request_ttl: Duration::from_millis(ttl_ms),
        }
    }

    fn link(a: &str) -> InspectLink {
        InspectLink::from_parts(Some("7"), Some(a), Some("2"), None).unwrap()
    }

    async fn ready_session(
        factory: Arc<MockFactory>,
        settings: SessionSettings,
    ) -> (
        Arc<SteamSession>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (tx, rx) = unbounded_channel();
        let session = SteamSession::new(
            0,
            Account::new("alpha", "pw"),
            settings,
            factory,
            tx,
            None,
        );
        session.log_in(None).await.unwrap();
        // 事件泵异步推进状态机
        for _ in 0..50 {
            if session.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (session, rx)
    }

    #[tokio::test]
    async fn test_login_reaches_ready() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (session, mut rx) = ready_session(factory.clone(), settings(20, 500)).await;
        assert!(session.is_ready());
        assert_eq!(session.state(), ReadyState::Ready);

        let mut saw_login_success = false;
        let mut saw_ready = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::LoginSuccess { .. } => saw_login_success = true,
                SessionEvent::Ready { .. } => saw_ready = true,
                _ => {}
            }
        }
        assert!(saw_login_success);
        assert!(saw_ready);
        // 没有游戏授权时先请求授权再上报
        let calls = factory.calls(0);
        assert!(calls.iter().any(|c| c == "request_license:730"));
        assert!(calls.iter().any(|c| c == "games_played:[]"));
        assert!(calls.iter().any(|c| c == "games_played:[730]"));
    }

    #[tokio::test]
    async fn test_inspect_normalizes_and_spaces() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (session, _rx) = ready_session(factory, settings(60, 500)).await;

        let (item, delay) = session.inspect(&link("42")).await.unwrap();
        assert_eq!(item.itemid, 42);
        assert_eq!(item.paintseed, 0);
        assert!(delay <= Duration::from_millis(60));
        // busy 保持到间隔结束
        assert!(session.is_busy());
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_inspect_serialized_by_busy() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (session, _rx) = ready_session(factory, settings(200, 500)).await;

        let _ = session.inspect(&link("1")).await.unwrap();
        let second = session.inspect(&link("2")).await;
        assert!(second.unwrap_err().is_no_session());
    }

    #[tokio::test]
    async fn test_inspect_ttl() {
        let mut behavior = MockBehavior::healthy();
        behavior.auto_reply = false;
        let factory = Arc::new(MockFactory::new(behavior));
        let (session, _rx) = ready_session(factory, settings(10, 50)).await;

        let err = session.inspect(&link("1")).await.unwrap_err();
        assert!(err.is_ttl_exceeded());
        assert!(!session.is_busy());
        // TTL 之后会话可以再次接单
        assert!(session.is_available());
    }

    #[tokio::test]
    async fn test_mismatched_reply_is_dropped() {
        let mut behavior = MockBehavior::healthy();
        behavior.auto_reply = false;
        let factory = Arc::new(MockFactory::new(behavior));
        let (session, _rx) = ready_session(factory.clone(), settings(10, 80)).await;

        let session_clone = session.clone();
        let handle = tokio::spawn(async move { session_clone.inspect(&link("1")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // 错误 id 的回包不匹配在途请求
        factory.emit(
            0,
            TransportEvent::InspectReply(RawItem {
                itemid: 999,
                ..Default::default()
            }),
        );
        let result = handle.await.unwrap();
        assert!(result.unwrap_err().is_ttl_exceeded());
    }

    #[tokio::test]
    async fn test_not_ready_rejected() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (tx, _rx) = unbounded_channel();
        let session = SteamSession::new(
            0,
            Account::new("alpha", "pw"),
            settings(10, 50),
            factory,
            tx,
            None,
        );
        let err = session.inspect(&link("1")).await.unwrap_err();
        assert!(err.is_no_session());
    }

    #[tokio::test]
    async fn test_logon_failure_classification_flows_to_event() {
        let mut behavior = MockBehavior::healthy();
        behavior.fail_logon = Some((Some(84), "throttled".to_string()));
        let factory = Arc::new(MockFactory::new(behavior));
        let (tx, mut rx) = unbounded_channel();
        let session = SteamSession::new(
            0,
            Account::new("alpha", "pw"),
            settings(10, 50),
            factory,
            tx,
            None,
        );
        session.log_in(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut reason = None;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::LoginFailed { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(FailureReason::RateLimit));
        assert_eq!(session.state(), ReadyState::Disconnected);
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal_event() {
        let mut behavior = MockBehavior::healthy();
        behavior.fail_logon = Some((Some(61), "invalid password".to_string()));
        let factory = Arc::new(MockFactory::new(behavior));
        let (tx, mut rx) = unbounded_channel();
        let session = SteamSession::new(
            0,
            Account::new("alpha", "pw"),
            settings(10, 50),
            factory,
            tx,
            None,
        );
        session.log_in(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut saw_auth_failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::AuthFailed { .. }) {
                saw_auth_failed = true;
            }
        }
        assert!(saw_auth_failed);
    }

    #[tokio::test]
    async fn test_update_proxy_recreates_transport() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (session, _rx) = ready_session(factory.clone(), settings(10, 50)).await;
        assert!(session.is_ready());

        session
            .update_proxy(Some("socks5://proxy1:1080".to_string()))
            .await
            .unwrap();
        assert!(!session.is_ready());
        assert_eq!(session.proxy_url().as_deref(), Some("socks5://proxy1:1080"));
        // 新传输层带上了新代理
        assert_eq!(factory.created_count(), 2);
        assert_eq!(
            factory.proxy_of(1).as_deref(),
            Some("socks5://proxy1:1080")
        );

        session.log_in(None).await.unwrap();
        for _ in 0..50 {
            if session.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_gc_disconnect_flips_unready() {
        let factory = Arc::new(MockFactory::new(MockBehavior::healthy()));
        let (session, mut rx) = ready_session(factory.clone(), settings(10, 50)).await;
        while rx.try_recv().is_ok() {}

        factory.emit(0, TransportEvent::GcDisconnected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_ready());
        assert_eq!(session.state(), ReadyState::GcDisconnected);

        factory.emit(0, TransportEvent::GcConnected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_ready());
    }
}
