use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// 通用错误详情类型
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Session,
    Proxy,
    Queue,
    Store,
    Api,
    Config,
    Auth,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Session => write!(f, "session"),
            ErrorKind::Proxy => write!(f, "proxy"),
            ErrorKind::Queue => write!(f, "queue"),
            ErrorKind::Store => write!(f, "store"),
            ErrorKind::Api => write!(f, "api"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Auth => write!(f, "auth"),
        }
    }
}

/// 客户端可见的稳定错误码，随响应体一起返回
///
/// 数值与原有线上契约保持一致，新增变体只能追加。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInspect,
    MaxRequests,
    TtlExceeded,
    SteamOffline,
    GenericBad,
    BadBody,
    BadSecret,
    MaxQueueSize,
    RateLimit,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::InvalidInspect => 2,
            ErrorCode::MaxRequests => 3,
            ErrorCode::TtlExceeded => 4,
            ErrorCode::SteamOffline => 5,
            ErrorCode::GenericBad => 6,
            ErrorCode::BadBody => 7,
            ErrorCode::BadSecret => 8,
            ErrorCode::MaxQueueSize => 9,
            ErrorCode::RateLimit => 10,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidInspect | ErrorCode::BadBody => 400,
            ErrorCode::BadSecret => 401,
            ErrorCode::MaxRequests | ErrorCode::MaxQueueSize | ErrorCode::RateLimit => 429,
            ErrorCode::TtlExceeded => 500,
            ErrorCode::SteamOffline => 503,
            ErrorCode::GenericBad => 500,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInspect => "Invalid inspect link structure",
            ErrorCode::MaxRequests => "You may only have a limited number of pending requests",
            ErrorCode::TtlExceeded => "The upstream did not reply in time",
            ErrorCode::SteamOffline => "The upstream appears to be offline",
            ErrorCode::GenericBad => "Something went wrong on our end",
            ErrorCode::BadBody => "Improperly formatted body",
            ErrorCode::BadSecret => "Bad secret",
            ErrorCode::MaxQueueSize => "The queue is full, please try again later",
            ErrorCode::RateLimit => "Rate limit exceeded, too many requests",
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_session(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Session)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Proxy)
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Queue)
    }

    pub fn is_store(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Store)
    }

    pub fn is_api(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Api)
    }

    /// 调度时找不到空闲会话；队列重新入队且不计一次尝试
    pub fn is_no_session(&self) -> bool {
        self.downcast::<ProxyError>()
            .map(|e| matches!(e, ProxyError::NoSessionAvailable))
            .unwrap_or(false)
            || self
                .downcast::<SessionError>()
                .map(|e| matches!(e, SessionError::Busy | SessionError::NotReady))
                .unwrap_or(false)
    }

    pub fn is_ttl_exceeded(&self) -> bool {
        self.downcast::<SessionError>()
            .map(|e| matches!(e, SessionError::TtlExceeded))
            .unwrap_or(false)
    }

    fn downcast<T: StdError + 'static>(&self) -> Option<&T> {
        self.inner
            .source
            .as_ref()
            .and_then(|s| s.downcast_ref::<T>())
    }

    /// 映射到客户端错误码
    pub fn code(&self) -> ErrorCode {
        if let Some(api) = self.downcast::<ApiError>() {
            return match api {
                ApiError::InvalidInspect => ErrorCode::InvalidInspect,
                ApiError::BadBody(_) => ErrorCode::BadBody,
                ApiError::BadSecret => ErrorCode::BadSecret,
                ApiError::MaxRequests => ErrorCode::MaxRequests,
                ApiError::MaxQueueSize => ErrorCode::MaxQueueSize,
                ApiError::SteamOffline => ErrorCode::SteamOffline,
                ApiError::RateLimit => ErrorCode::RateLimit,
                ApiError::PendingAuthNotFound(_) => ErrorCode::GenericBad,
            };
        }
        if let Some(queue) = self.downcast::<QueueError>() {
            return match queue {
                QueueError::MaxAttemptsExceeded { .. } => ErrorCode::TtlExceeded,
                _ => ErrorCode::GenericBad,
            };
        }
        if self.is_ttl_exceeded() {
            return ErrorCode::TtlExceeded;
        }
        ErrorCode::GenericBad
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("patina::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::new(ErrorKind::Session, Some(err))
    }
}

impl From<ProxyError> for Error {
    fn from(err: ProxyError) -> Self {
        Error::new(ErrorKind::Proxy, Some(err))
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::new(ErrorKind::Queue, Some(err))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::new(ErrorKind::Store, Some(err))
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::new(ErrorKind::Api, Some(err))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::new(ErrorKind::Config, Some(err))
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::new(ErrorKind::Auth, Some(err))
    }
}

// 具体错误类型定义
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not ready")]
    NotReady,
    #[error("session already holds an in-flight inspect")]
    Busy,
    #[error("ttl exceeded")]
    TtlExceeded,
    #[error("session disconnected: {0}")]
    Disconnected(String),
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("logon failed: {0}")]
    LogonFailed(String),
    #[error("game coordinator unavailable")]
    GcUnavailable,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy file unreadable: {0}")]
    FileUnreadable(#[source] BoxError),
    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),
    #[error("no proxy group can accept a request")]
    NoGroupAvailable,
    #[error("no session available")]
    NoSessionAvailable,
    #[error("proxy group not found: {0}")]
    GroupNotFound(usize),
    #[error("session not bound to any group: {0}")]
    SessionUnbound(usize),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("max attempts exceeded after {attempts} tries")]
    MaxAttemptsExceeded { attempts: u32 },
    #[error("queue is stopped")]
    Stopped,
    #[error("queue operation failed: {0}")]
    OperationFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    ConnectionFailed(#[source] BoxError),
    #[error("store query failed: {0}")]
    QueryFailed(#[source] BoxError),
    #[error("invalid stored payload: {0}")]
    InvalidPayload(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid inspect link")]
    InvalidInspect,
    #[error("bad body: {0}")]
    BadBody(String),
    #[error("bad secret")]
    BadSecret,
    #[error("per-client request cap exceeded")]
    MaxRequests,
    #[error("queue size cap exceeded")]
    MaxQueueSize,
    #[error("no session is ready")]
    SteamOffline,
    #[error("rate limit exceeded")]
    RateLimit,
    #[error("no pending auth session for {0}")]
    PendingAuthNotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Read(#[source] BoxError),
    #[error("config parse failed: {0}")]
    Parse(#[source] BoxError),
    #[error("no accounts configured")]
    MissingAccounts,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("an interactive auth code is required")]
    CodeRequired,
    #[error("invalid shared secret: {0}")]
    InvalidSecret(String),
}

// 便利函数，用于创建常见的错误类型
impl Error {
    pub fn no_session_available() -> Self {
        Error::from(ProxyError::NoSessionAvailable)
    }

    pub fn session_not_ready() -> Self {
        Error::from(SessionError::NotReady)
    }

    pub fn ttl_exceeded() -> Self {
        Error::from(SessionError::TtlExceeded)
    }

    pub fn steam_offline() -> Self {
        Error::from(ApiError::SteamOffline)
    }

    pub fn invalid_inspect() -> Self {
        Error::from(ApiError::InvalidInspect)
    }

    pub fn transport<E: Into<BoxError>>(source: E) -> Self {
        Error::from(SessionError::Transport(source.into()))
    }
}

// 针对常见的外部错误类型的转换
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Store, Some(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::from(StoreError::InvalidPayload(err.to_string().into()))
    }
}

impl From<sea_orm::DbErr> for Error {
    fn from(err: sea_orm::DbErr) -> Self {
        Error::from(StoreError::QueryFailed(err.to_string().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::no_session_available();
        assert!(err.is_proxy());
        assert!(err.is_no_session());
    }

    #[test]
    fn test_error_display() {
        let err = Error::ttl_exceeded();
        assert_eq!(err.to_string(), "session error: ttl exceeded");
    }

    #[test]
    fn test_error_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out");
        let err = Error::from(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_client_codes_are_stable() {
        assert_eq!(ErrorCode::InvalidInspect.code(), 2);
        assert_eq!(ErrorCode::MaxRequests.code(), 3);
        assert_eq!(ErrorCode::TtlExceeded.code(), 4);
        assert_eq!(ErrorCode::SteamOffline.code(), 5);
        assert_eq!(ErrorCode::GenericBad.code(), 6);
        assert_eq!(ErrorCode::BadBody.code(), 7);
        assert_eq!(ErrorCode::BadSecret.code(), 8);
        assert_eq!(ErrorCode::MaxQueueSize.code(), 9);
        assert_eq!(ErrorCode::RateLimit.code(), 10);
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(Error::steam_offline().code(), ErrorCode::SteamOffline);
        assert_eq!(Error::ttl_exceeded().code(), ErrorCode::TtlExceeded);
        assert_eq!(
            Error::from(QueueError::MaxAttemptsExceeded { attempts: 3 }).code(),
            ErrorCode::TtlExceeded
        );
        assert_eq!(Error::no_session_available().code(), ErrorCode::GenericBad);
    }

    #[test]
    fn test_no_session_is_never_an_attempt() {
        assert!(Error::from(SessionError::Busy).is_no_session());
        assert!(Error::session_not_ready().is_no_session());
        assert!(!Error::ttl_exceeded().is_no_session());
    }
}
