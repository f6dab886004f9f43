use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::inspect::InspectLink;
use common::model::item::ItemData;
use errors::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// 缓存里的一条检视记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem {
    pub asset_id: i64,
    pub owner_id: i64,
    pub d: i64,
    pub def_index: i32,
    pub paint_index: i32,
    pub paint_seed: i32,
    pub float_value: f64,
    pub stattrak: bool,
    pub souvenir: bool,
    pub price: Option<i64>,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl StoredItem {
    pub fn from_inspect(
        link: &InspectLink,
        item: &ItemData,
        price: Option<i64>,
    ) -> Result<Self> {
        let asset_id = link.asset_id()?;
        let owner_id = link.owner().parse::<i64>().unwrap_or(0);
        let d = link.d.parse::<i64>().unwrap_or(0);
        // 排名标注不入库，存库前剥掉
        let mut bare = item.clone();
        bare.low_rank = None;
        bare.high_rank = None;
        let payload = serde_json::to_value(&bare)
            .map_err(|e| StoreError::InvalidPayload(e.to_string().into()))?;
        Ok(StoredItem {
            asset_id,
            owner_id,
            d,
            def_index: item.defindex,
            paint_index: item.paintindex,
            paint_seed: item.paintseed as i32,
            float_value: item.floatvalue,
            stattrak: item.is_stattrak(),
            souvenir: item.quality == Some(12),
            price,
            payload,
            updated_at: Utc::now(),
        })
    }

    pub fn to_item_data(&self) -> Result<ItemData> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| StoreError::InvalidPayload(e.to_string().into()).into())
    }
}

/// 外部关系库的读写接口；实现只负责存取，不管业务
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
    async fn fetch(&self, asset_ids: &[i64]) -> Result<Vec<StoredItem>>;
    async fn upsert(&self, item: &StoredItem) -> Result<()>;
    async fn update_price(&self, asset_id: i64, price: i64) -> Result<()>;
    /// 同皮肤下 float 更小的条数，用于低位排名
    async fn count_lower(&self, def_index: i32, paint_index: i32, float_value: f64)
    -> Result<u64>;
    /// 同皮肤下 float 更大的条数，用于高位排名
    async fn count_higher(
        &self,
        def_index: i32,
        paint_index: i32,
        float_value: f64,
    ) -> Result<u64>;
}
