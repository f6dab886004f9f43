use serde::{Deserialize, Serialize};

/// 一个上游会话对应的账号，加载后不可变
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub password: String,
    /// 短码直接发送，长密钥用于派生一次性验证码
    pub auth_secret: Option<String>,
}

/// 账号二步验证材料的形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSecret {
    None,
    /// ≤ 5 字符，按原样作为静态验证码发送
    Static,
    /// 共享密钥，按时间窗派生验证码
    Shared,
}

impl Account {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            auth_secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }

    pub fn secret_kind(&self) -> AuthSecret {
        match &self.auth_secret {
            None => AuthSecret::None,
            Some(s) if s.len() <= 5 => AuthSecret::Static,
            Some(_) => AuthSecret::Shared,
        }
    }
}
