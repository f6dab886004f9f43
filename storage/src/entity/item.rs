use sea_orm::entity::prelude::*;

/// 缓存的检视结果；payload 列保存完整归一化负载，
/// 其余列为排名查询留的索引字段
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub asset_id: i64,
    pub owner_id: i64,
    pub d: i64,
    pub def_index: i32,
    pub paint_index: i32,
    pub paint_seed: i32,
    #[sea_orm(column_type = "Double")]
    pub float_value: f64,
    pub stattrak: bool,
    pub souvenir: bool,
    pub price: Option<i64>,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
