use async_trait::async_trait;
use common::model::item::RawItem;
use errors::Result;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub two_factor_code: Option<String>,
}

/// 传输层上抛的事件；会话据此推进就绪状态机
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    LoggedOn { owns_game: bool },
    GcConnected,
    GcDisconnected,
    InspectReply(RawItem),
    LogonFailed { eresult: Option<i32>, message: String },
    Disconnected { eresult: Option<i32>, message: String },
    /// 上游确实在等一个交互式验证码
    CodeRequired,
}

/// 上游客户端的线协议，按能力建模
///
/// 登录结果通过事件通道返回，方法本身只报告发送层面的失败。
/// 约定：`log_off` 是主动断开，不得再上抛 `Disconnected`。
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn log_on(&mut self, credentials: &Credentials) -> Result<()>;
    async fn request_license(&mut self, app_id: u32) -> Result<()>;
    async fn set_games_played(&mut self, app_ids: &[u32]) -> Result<()>;
    async fn send_inspect(&mut self, owner: &str, asset_id: &str, d: &str) -> Result<()>;
    async fn log_off(&mut self) -> Result<()>;
}

/// 每次重建传输层都经过工厂，代理在创建时绑定
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        proxy_url: Option<&str>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Transport>>;
}
