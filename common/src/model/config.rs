use crate::model::account::Account;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_regex_origins: Vec<String>,
    pub bulk_key: Option<String>,
    pub auth_key: Option<String>,
    pub price_key: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BotConfig {
    /// 超过此数量的账号进入备用池
    pub max_online_bots: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_request_ttl_ms")]
    pub request_ttl_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_spare_account_delay_ms")]
    pub spare_account_delay_ms: u64,
}

fn default_request_delay_ms() -> u64 {
    1100
}

fn default_request_ttl_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_spare_account_delay_ms() -> u64 {
    5000
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct QueueConfig {
    /// 0 表示不限制
    #[serde(default)]
    pub max_simultaneous_requests: usize,
    /// 0 表示不限制
    #[serde(default)]
    pub max_queue_size: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub exclude_failed: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            exclude_failed: true,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    /// 代理列表文件，每行一个 http:// 或 socks5:// URL
    pub file: Option<String>,
    #[serde(default = "default_max_requests_per_proxy")]
    pub max_requests_per_proxy: u32,
    #[serde(default = "default_request_cooldown_ms")]
    pub request_cooldown_ms: u64,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_requests_per_proxy() -> u32 {
    3
}

fn default_request_cooldown_ms() -> u64 {
    1000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_requests_per_proxy: default_max_requests_per_proxy(),
            request_cooldown_ms: default_request_cooldown_ms(),
            strategy: SelectionStrategy::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    LeastLoaded,
    RoundRobin,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostgresConfig {
    pub database_host: String,
    pub database_port: u16,
    pub database_user: String,
    pub database_password: String,
    pub database_name: String,
    pub database_schema: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_limit_max")]
    pub max_requests: u32,
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_rate_limit_max() -> u32 {
    60
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggerSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub name: String,
    pub api: ApiConfig,
    pub bots: BotConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub db: Option<PostgresConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub logger: Option<LoggerSection>,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl Config {
    pub fn load(path: &str) -> errors::Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| errors::ConfigError::Read(e.into()))?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> errors::Result<Self> {
        let config: Config = toml::from_str(config_str)
            .map_err(|e| errors::ConfigError::Parse(e.to_string().into()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        name = "patina"

        [api]
        port = 8080
        allowed_origins = ["https://example.com"]
        bulk_key = "secret"

        [bots]
        max_online_bots = 3

        [queue]
        max_simultaneous_requests = 2
        max_queue_size = 100

        [proxy]
        file = "proxies.txt"
        max_requests_per_proxy = 2
        request_cooldown_ms = 500
        strategy = "round_robin"

        [[accounts]]
        username = "alpha"
        password = "pw"

        [[accounts]]
        username = "beta"
        password = "pw"
        auth_secret = "ABCDE"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.name, "patina");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.bots.max_online_bots, 3);
        assert_eq!(config.bots.request_delay_ms, 1100);
        assert_eq!(config.queue.max_simultaneous_requests, 2);
        assert_eq!(config.proxy.strategy, SelectionStrategy::RoundRobin);
        assert!(config.proxy.retry.enabled);
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[1].auth_secret.as_deref(), Some("ABCDE"));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Config::parse("not = [toml").is_err());
    }
}
