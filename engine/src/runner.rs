use crate::api::{ApiState, router};
use crate::dispatcher::Dispatcher;
use crate::fleet::Fleet;
use common::model::config::Config;
use errors::{ConfigError, Result};
use log::{info, warn};
use proxy::ProxyPool;
use queue::{CapacityGate, InspectQueue};
use session::{SessionSettings, TransportFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::{CacheFacade, ItemStore, MemoryItemStore, PgItemStore};
use tokio::sync::broadcast;
use utils::rate_limit::{FixedWindowRateLimiter, RateLimitConfig};

/// 并发上限随就绪会话数变化的采样周期
const SIZING_INTERVAL: Duration = Duration::from_millis(50);

struct PoolGate(Arc<ProxyPool>);

impl CapacityGate for PoolGate {
    fn can_accept(&self) -> bool {
        self.0.can_accept_more()
    }
}

/// 组装并运行整个服务；传输层工厂由调用方注入
pub struct Runner;

impl Runner {
    pub async fn run(config: Config, factory: Arc<dyn TransportFactory>) -> Result<()> {
        if config.accounts.is_empty() {
            return Err(ConfigError::MissingAccounts.into());
        }

        if let Some(logger) = &config.logger {
            let mut logger_config =
                utils::logger::LoggerConfig::for_app(&config.name).with_level(&logger.level);
            if let Some(file) = &logger.file {
                logger_config.outputs = vec![
                    utils::logger::LogOutputConfig::Console {},
                    utils::logger::LogOutputConfig::File {
                        path: file.into(),
                        rotation: Some("daily".to_string()),
                    },
                ];
            }
            if let Err(e) = logger_config.init() {
                eprintln!("Logger init failed: {e}");
            }
        } else if let Err(e) = utils::logger::init_app_logger(&config.name) {
            eprintln!("Logger init failed: {e}");
        }

        let store: Arc<dyn ItemStore> = match &config.db {
            Some(db) => {
                match utils::connector::postgres_connection(
                    &db.database_host,
                    db.database_port,
                    &db.database_name,
                    &db.database_schema,
                    &db.database_user,
                    &db.database_password,
                )
                .await
                {
                    Some(conn) => {
                        info!("Item store connected");
                        Arc::new(PgItemStore::new(conn))
                    }
                    None => {
                        warn!("Item store unreachable, using in-memory cache");
                        Arc::new(MemoryItemStore::new())
                    }
                }
            }
            None => Arc::new(MemoryItemStore::new()),
        };
        let cache = Arc::new(CacheFacade::new(store));

        let pool = Arc::new(ProxyPool::load(&config.proxy));
        info!(
            "Proxy pool ready: {} groups, max concurrency {}",
            pool.group_count(),
            pool.max_concurrency()
        );

        let settings = SessionSettings {
            request_delay: Duration::from_millis(config.bots.request_delay_ms),
            request_ttl: Duration::from_millis(config.bots.request_ttl_ms),
        };
        let fleet = Fleet::new(
            config.accounts.clone(),
            config.bots.max_online_bots,
            Duration::from_millis(config.bots.spare_account_delay_ms),
            Duration::from_millis(config.proxy.retry.retry_delay_ms),
            settings,
            factory,
            Some(pool.clone()),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            fleet.clone(),
            Some(pool.clone()),
            cache.clone(),
            config.proxy.strategy,
        ));
        let gate: Arc<dyn CapacityGate> = Arc::new(PoolGate(pool.clone()));
        let inspect_queue = InspectQueue::new(dispatcher, Some(gate), config.bots.max_attempts);

        let (shutdown_tx, _) = broadcast::channel(8);
        inspect_queue.start(shutdown_tx.subscribe());
        fleet.start(&shutdown_tx);

        // 并发上限 = min(池并发, 就绪会话数)
        {
            let queue = inspect_queue.clone();
            let fleet = fleet.clone();
            let pool = pool.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SIZING_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            let target = pool.max_concurrency().min(fleet.ready_count());
                            queue.resize(target);
                        }
                    }
                }
            });
        }

        let limiter = config
            .rate_limit
            .as_ref()
            .filter(|rl| rl.enabled)
            .map(|rl| {
                Arc::new(FixedWindowRateLimiter::new(RateLimitConfig::new(
                    rl.max_requests,
                    Duration::from_millis(rl.window_ms),
                )))
            });

        let port = config.api.port;
        let state = ApiState {
            config: Arc::new(config),
            fleet,
            queue: inspect_queue,
            pool: Some(pool),
            cache,
            limiter,
        };

        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Listening on 0.0.0.0:{}", port);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        info!("Shutting down");
        let _ = shutdown_tx.send(());
        Ok(())
    }
}
