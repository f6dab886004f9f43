use crate::fleet::Fleet;
use async_trait::async_trait;
use common::model::config::SelectionStrategy;
use common::model::item::ItemData;
use common::model::job::SlotOutcome;
use errors::Result;
use log::warn;
use metrics::{counter, histogram};
use proxy::ProxyPool;
use queue::{QueueEntry, QueueHandler};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::CacheFacade;

/// 队列与舰队之间的胶水：选会话、发检视、写槽位、归还租约
pub struct Dispatcher {
    fleet: Arc<Fleet>,
    pool: Option<Arc<ProxyPool>>,
    cache: Arc<CacheFacade>,
    strategy: SelectionStrategy,
}

impl Dispatcher {
    pub fn new(
        fleet: Arc<Fleet>,
        pool: Option<Arc<ProxyPool>>,
        cache: Arc<CacheFacade>,
        strategy: SelectionStrategy,
    ) -> Self {
        Dispatcher {
            fleet,
            pool,
            cache,
            strategy,
        }
    }

    async fn finish(&self, entry: &QueueEntry, item: &ItemData) {
        let enriched = match self
            .cache
            .store_result(&entry.link, item, entry.price)
            .await
        {
            Ok(enriched) => enriched,
            Err(e) => {
                // 入库失败不挡结果，原样返回
                warn!("Cache insert for asset {} failed: {}", entry.link.a, e);
                item.clone()
            }
        };
        entry
            .job
            .resolve(entry.slot, SlotOutcome::Item(Box::new(enriched)));
    }
}

#[async_trait]
impl QueueHandler for Dispatcher {
    async fn handle(&self, entry: &QueueEntry) -> Result<Duration> {
        let started = Instant::now();
        match &self.pool {
            Some(pool) => {
                let lease = pool.acquire(self.strategy)?;
                let Some(session) = self.fleet.session(lease.session) else {
                    pool.release(&lease, false);
                    return Err(errors::Error::no_session_available());
                };
                match session.inspect(&entry.link).await {
                    Ok((item, delay)) => {
                        self.finish(entry, &item).await;
                        pool.release(&lease, true);
                        counter!("dispatch_total", "result" => "ok").increment(1);
                        histogram!("dispatch_duration_seconds")
                            .record(started.elapsed().as_secs_f64());
                        Ok(delay)
                    }
                    Err(e) => {
                        pool.release(&lease, false);
                        counter!("dispatch_total", "result" => "err").increment(1);
                        Err(e)
                    }
                }
            }
            None => {
                let session = self
                    .fleet
                    .reserve_any()
                    .ok_or_else(errors::Error::no_session_available)?;
                let result = session.inspect(&entry.link).await;
                session.release_reservation();
                match result {
                    Ok((item, delay)) => {
                        self.finish(entry, &item).await;
                        counter!("dispatch_total", "result" => "ok").increment(1);
                        Ok(delay)
                    }
                    Err(e) => {
                        counter!("dispatch_total", "result" => "err").increment(1);
                        Err(e)
                    }
                }
            }
        }
    }
}
