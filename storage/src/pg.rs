use crate::entity::item;
use crate::entity::prelude::Item;
use crate::store::{ItemStore, StoredItem};
use async_trait::async_trait;
use errors::Result;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};

/// sea-orm 实现；连接由 utils::connector 建立
pub struct PgItemStore {
    db: DatabaseConnection,
}

impl PgItemStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn to_stored(model: item::Model) -> StoredItem {
    StoredItem {
        asset_id: model.asset_id,
        owner_id: model.owner_id,
        d: model.d,
        def_index: model.def_index,
        paint_index: model.paint_index,
        paint_seed: model.paint_seed,
        float_value: model.float_value,
        stattrak: model.stattrak,
        souvenir: model.souvenir,
        price: model.price,
        payload: model.payload,
        updated_at: model.updated_at,
    }
}

fn to_active(item: &StoredItem) -> item::ActiveModel {
    item::ActiveModel {
        asset_id: Set(item.asset_id),
        owner_id: Set(item.owner_id),
        d: Set(item.d),
        def_index: Set(item.def_index),
        paint_index: Set(item.paint_index),
        paint_seed: Set(item.paint_seed),
        float_value: Set(item.float_value),
        stattrak: Set(item.stattrak),
        souvenir: Set(item.souvenir),
        price: Set(item.price),
        payload: Set(item.payload.clone()),
        updated_at: Set(item.updated_at),
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn ping(&self) -> Result<()> {
        self.db.ping().await?;
        Ok(())
    }

    async fn fetch(&self, asset_ids: &[i64]) -> Result<Vec<StoredItem>> {
        let models = Item::find()
            .filter(item::Column::AssetId.is_in(asset_ids.to_vec()))
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(to_stored).collect())
    }

    async fn upsert(&self, stored: &StoredItem) -> Result<()> {
        Item::insert(to_active(stored))
            .on_conflict(
                OnConflict::column(item::Column::AssetId)
                    .update_columns([
                        item::Column::OwnerId,
                        item::Column::D,
                        item::Column::DefIndex,
                        item::Column::PaintIndex,
                        item::Column::PaintSeed,
                        item::Column::FloatValue,
                        item::Column::Stattrak,
                        item::Column::Souvenir,
                        item::Column::Price,
                        item::Column::Payload,
                        item::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_price(&self, asset_id: i64, price: i64) -> Result<()> {
        Item::update_many()
            .col_expr(item::Column::Price, Expr::value(price))
            .filter(item::Column::AssetId.eq(asset_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn count_lower(
        &self,
        def_index: i32,
        paint_index: i32,
        float_value: f64,
    ) -> Result<u64> {
        let count = Item::find()
            .filter(item::Column::DefIndex.eq(def_index))
            .filter(item::Column::PaintIndex.eq(paint_index))
            .filter(item::Column::FloatValue.lt(float_value))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn count_higher(
        &self,
        def_index: i32,
        paint_index: i32,
        float_value: f64,
    ) -> Result<u64> {
        let count = Item::find()
            .filter(item::Column::DefIndex.eq(def_index))
            .filter(item::Column::PaintIndex.eq(paint_index))
            .filter(item::Column::FloatValue.gt(float_value))
            .count(&self.db)
            .await?;
        Ok(count)
    }
}
