use crate::store::{ItemStore, StoredItem};
use async_trait::async_trait;
use dashmap::DashMap;
use errors::Result;

/// 无数据库运行与测试用的内存实现
#[derive(Default)]
pub struct MemoryItemStore {
    items: DashMap<i64, StoredItem>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn fetch(&self, asset_ids: &[i64]) -> Result<Vec<StoredItem>> {
        Ok(asset_ids
            .iter()
            .filter_map(|id| self.items.get(id).map(|entry| entry.value().clone()))
            .collect())
    }

    async fn upsert(&self, item: &StoredItem) -> Result<()> {
        self.items.insert(item.asset_id, item.clone());
        Ok(())
    }

    async fn update_price(&self, asset_id: i64, price: i64) -> Result<()> {
        if let Some(mut entry) = self.items.get_mut(&asset_id) {
            entry.price = Some(price);
        }
        Ok(())
    }

    async fn count_lower(
        &self,
        def_index: i32,
        paint_index: i32,
        float_value: f64,
    ) -> Result<u64> {
        Ok(self
            .items
            .iter()
            .filter(|entry| {
                entry.def_index == def_index
                    && entry.paint_index == paint_index
                    && entry.float_value < float_value
            })
            .count() as u64)
    }

    async fn count_higher(
        &self,
        def_index: i32,
        paint_index: i32,
        float_value: f64,
    ) -> Result<u64> {
        Ok(self
            .items
            .iter()
            .filter(|entry| {
                entry.def_index == def_index
                    && entry.paint_index == paint_index
                    && entry.float_value > float_value
            })
            .count() as u64)
    }
}
