pub mod proxy_pool;

pub use proxy_pool::{
    GroupStats, PoolSession, PoolStats, ProxyPool, RetryDecision, SessionLease,
};
