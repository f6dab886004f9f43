use crate::store::{ItemStore, StoredItem};
use common::model::inspect::InspectLink;
use common::model::item::ItemData;
use common::model::job::{Job, SlotOutcome};
use errors::Result;
use log::warn;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;

/// 浮点值进入全局前后 1000 名时标注排名
const RANK_WINDOW: u64 = 1000;

/// 缓存门面：命中解析、成功入库、排名标注
pub struct CacheFacade {
    store: Arc<dyn ItemStore>,
}

impl CacheFacade {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn ItemStore> {
        self.store.clone()
    }

    /// 用缓存填充任务的槽位，返回命中数
    ///
    /// 带价键的提交在命中时也更新存量价格。
    pub async fn resolve_job(&self, job: &Job) -> Result<usize> {
        let remaining = job.remaining_links();
        let asset_ids: Vec<i64> = remaining
            .iter()
            .filter_map(|(_, l)| l.link.asset_id().ok())
            .collect();
        if asset_ids.is_empty() {
            return Ok(0);
        }

        let found = self.store.fetch(&asset_ids).await?;
        let by_id: HashMap<i64, &StoredItem> =
            found.iter().map(|item| (item.asset_id, item)).collect();

        let mut hits = 0;
        for (slot, job_link) in remaining {
            let Ok(asset_id) = job_link.link.asset_id() else {
                continue;
            };
            let Some(stored) = by_id.get(&asset_id) else {
                continue;
            };
            if let Some(price) = job_link.price
                && stored.price != Some(price)
                && let Err(e) = self.store.update_price(asset_id, price).await
            {
                warn!("Price update for asset {} failed: {}", asset_id, e);
            }
            match stored.to_item_data() {
                Ok(mut item) => {
                    self.annotate(&mut item, stored).await;
                    job.resolve(slot, SlotOutcome::Item(Box::new(item)));
                    hits += 1;
                    counter!("cache_hits_total").increment(1);
                }
                Err(e) => {
                    warn!("Cached payload for asset {} unreadable: {}", asset_id, e);
                }
            }
        }
        Ok(hits)
    }

    /// 新结果入库并带排名返回
    pub async fn store_result(
        &self,
        link: &InspectLink,
        item: &ItemData,
        price: Option<i64>,
    ) -> Result<ItemData> {
        let stored = StoredItem::from_inspect(link, item, price)?;
        self.store.upsert(&stored).await?;
        counter!("cache_inserts_total").increment(1);
        let mut item = item.clone();
        self.annotate(&mut item, &stored).await;
        Ok(item)
    }

    async fn annotate(&self, item: &mut ItemData, stored: &StoredItem) {
        if let Ok(lower) = self
            .store
            .count_lower(stored.def_index, stored.paint_index, stored.float_value)
            .await
            && lower < RANK_WINDOW
        {
            item.low_rank = Some(lower as u32 + 1);
        }
        if let Ok(higher) = self
            .store
            .count_higher(stored.def_index, stored.paint_index, stored.float_value)
            .await
            && higher < RANK_WINDOW
        {
            item.high_rank = Some(higher as u32 + 1);
        }
    }
}
