use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// 限流器配置项
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// 窗口内允许的最大请求次数
    pub max_requests: u32,
    /// 窗口长度
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// 固定窗口限流器
///
/// 按标识符计数，窗口过期后重置。超出返回 false，由调用方决定响应。
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    config: RateLimitConfig,
    records: RwLock<HashMap<String, WindowState>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl FixedWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// 记录一次请求并判断是否放行
    pub fn check(&self, identifier: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records.write().unwrap();

        // 顺手清掉长期未访问的条目，避免堆积
        if records.len() > 10_000 {
            let window = self.config.window;
            records.retain(|_, state| now.duration_since(state.window_start) < window * 2);
        }

        let state = records.entry(identifier.to_string()).or_insert(WindowState {
            window_start: now,
            count: 0,
        });

        if now.duration_since(state.window_start) >= self.config.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= self.config.max_requests {
            return false;
        }
        state.count += 1;
        true
    }

    /// 当前窗口内某标识符已计数的请求数
    pub fn current_count(&self, identifier: &str) -> u32 {
        let records = self.records.read().unwrap();
        match records.get(identifier) {
            Some(state) if state.window_start.elapsed() < self.config.window => state.count,
            _ => 0,
        }
    }
}
