use serde::{Deserialize, Serialize};

/// 上游回包的原始负载，字段名与线协议一致
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RawItem {
    pub itemid: u64,
    pub defindex: i32,
    pub paintindex: i32,
    pub rarity: Option<i32>,
    pub quality: Option<i32>,
    pub paintwear: Option<f64>,
    pub paintseed: Option<u32>,
    pub killeaterscoretype: Option<i32>,
    pub killeatervalue: Option<i64>,
    pub customname: Option<String>,
    #[serde(default)]
    pub stickers: Vec<RawSticker>,
    pub inventory: Option<i64>,
    pub origin: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RawSticker {
    pub sticker_id: u32,
    pub slot: Option<u32>,
    pub wear: Option<f64>,
    pub scale: Option<f64>,
    pub rotation: Option<f64>,
    pub tint_id: Option<u32>,
}

/// 归一化后的检视结果，序列化时丢弃空字段
///
/// 归一化规则：paintwear → floatvalue；缺失的 paintseed 置 0；
/// sticker_id → stickerId。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ItemData {
    pub itemid: u64,
    pub defindex: i32,
    pub paintindex: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rarity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,
    pub paintseed: u32,
    pub floatvalue: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killeaterscoretype: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killeatervalue: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customname: Option<String>,
    pub stickers: Vec<Sticker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_rank: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sticker {
    #[serde(rename = "stickerId")]
    pub sticker_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wear: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tint_id: Option<u32>,
}

impl From<RawSticker> for Sticker {
    fn from(raw: RawSticker) -> Self {
        Sticker {
            sticker_id: raw.sticker_id,
            slot: raw.slot,
            wear: raw.wear,
            scale: raw.scale,
            rotation: raw.rotation,
            tint_id: raw.tint_id,
        }
    }
}

impl From<RawItem> for ItemData {
    fn from(raw: RawItem) -> Self {
        ItemData {
            itemid: raw.itemid,
            defindex: raw.defindex,
            paintindex: raw.paintindex,
            rarity: raw.rarity,
            quality: raw.quality,
            paintseed: raw.paintseed.unwrap_or(0),
            floatvalue: raw.paintwear.unwrap_or(0.0),
            killeaterscoretype: raw.killeaterscoretype,
            killeatervalue: raw.killeatervalue,
            customname: raw.customname,
            stickers: raw.stickers.into_iter().map(Sticker::from).collect(),
            inventory: raw.inventory,
            origin: raw.origin,
            low_rank: None,
            high_rank: None,
        }
    }
}

impl ItemData {
    /// StatTrak 物品携带击杀计数器
    pub fn is_stattrak(&self) -> bool {
        self.killeatervalue.is_some()
    }
}
