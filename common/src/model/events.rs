use serde::{Deserialize, Serialize};
use std::fmt;

/// 登录失败的归类，决定监督器的重试策略
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// eresult 63/65 或二步验证提示，视为误报，不标记账号
    SteamGuard,
    RateLimit,
    Proxy,
    /// 密码错误 / 二步验证失败，终止性
    Auth,
    Other,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SteamGuard => write!(f, "steamguard"),
            FailureReason::RateLimit => write!(f, "ratelimit"),
            FailureReason::Proxy => write!(f, "proxy"),
            FailureReason::Auth => write!(f, "auth"),
            FailureReason::Other => write!(f, "other"),
        }
    }
}

/// 会话生命周期消息，经每个会话的输出通道送达监督器
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ready {
        session: usize,
    },
    Unready {
        session: usize,
    },
    LoginSuccess {
        session: usize,
        username: String,
    },
    LoginFailed {
        session: usize,
        username: String,
        reason: FailureReason,
        message: String,
    },
    AuthFailed {
        session: usize,
        username: String,
        message: String,
    },
    /// 上游确实要求交互式验证码，区别于 SteamGuard 误报
    CodeRequired {
        session: usize,
        username: String,
    },
}

impl SessionEvent {
    pub fn session(&self) -> usize {
        match self {
            SessionEvent::Ready { session }
            | SessionEvent::Unready { session }
            | SessionEvent::LoginSuccess { session, .. }
            | SessionEvent::LoginFailed { session, .. }
            | SessionEvent::AuthFailed { session, .. }
            | SessionEvent::CodeRequired { session, .. } => *session,
        }
    }
}
