use errors::{ApiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const PREVIEW_MARKER: &str = "csgo_econ_action_preview";

/// 检视三元组 (s, a, d) 加可选 m，标识一次上游查询
///
/// owner 取 s（s ≠ "0" 时），否则取 m；a 是回包的关联键。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct InspectLink {
    pub s: String,
    pub a: String,
    pub d: String,
    pub m: String,
}

impl InspectLink {
    /// 从离散参数构建，s 与 m 必须恰好有一个有效
    pub fn from_parts(
        s: Option<&str>,
        a: Option<&str>,
        d: Option<&str>,
        m: Option<&str>,
    ) -> Result<Self> {
        let a = a.filter(|v| is_digits(v)).ok_or(ApiError::InvalidInspect)?;
        let d = d.filter(|v| is_digits(v)).ok_or(ApiError::InvalidInspect)?;
        let s = s.unwrap_or("0");
        let m = m.unwrap_or("0");
        if !is_digits(s) || !is_digits(m) {
            return Err(ApiError::InvalidInspect.into());
        }
        if s == "0" && m == "0" {
            return Err(ApiError::InvalidInspect.into());
        }
        Ok(Self {
            s: s.to_string(),
            a: a.to_string(),
            d: d.to_string(),
            m: m.to_string(),
        })
    }

    /// 解析 steam://rungame/730/.../+csgo_econ_action_preview S..A..D.. 形式的链接
    ///
    /// `%20` 在查询参数里通常已被解码成空格，两种形式都接受。
    pub fn parse_url(url: &str) -> Result<Self> {
        let idx = url
            .find(PREVIEW_MARKER)
            .ok_or(ApiError::InvalidInspect)?;
        let mut payload = &url[idx + PREVIEW_MARKER.len()..];
        if let Some(stripped) = payload.strip_prefix("%20") {
            payload = stripped;
        }
        let payload = payload.trim_start_matches(' ');

        let (owner_tag, rest) = match payload.chars().next() {
            Some('S') => ('S', &payload[1..]),
            Some('M') => ('M', &payload[1..]),
            _ => return Err(ApiError::InvalidInspect.into()),
        };
        let a_pos = rest.find('A').ok_or(ApiError::InvalidInspect)?;
        let d_pos = rest.find('D').ok_or(ApiError::InvalidInspect)?;
        if d_pos < a_pos {
            return Err(ApiError::InvalidInspect.into());
        }
        let owner = &rest[..a_pos];
        let a = &rest[a_pos + 1..d_pos];
        let d = &rest[d_pos + 1..];

        match owner_tag {
            'S' => Self::from_parts(Some(owner), Some(a), Some(d), None),
            _ => Self::from_parts(None, Some(a), Some(d), Some(owner)),
        }
    }

    /// 回包归属方：s ≠ "0" 用 s，否则用 m
    pub fn owner(&self) -> &str {
        if self.s != "0" { &self.s } else { &self.m }
    }

    /// 市场链接：owner 来自 m
    pub fn is_market(&self) -> bool {
        self.s == "0"
    }

    pub fn asset_id(&self) -> Result<i64> {
        self.a
            .parse::<i64>()
            .map_err(|_| ApiError::InvalidInspect.into())
    }
}

impl fmt::Display for InspectLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tag, owner) = if self.is_market() {
            ('M', &self.m)
        } else {
            ('S', &self.s)
        };
        write!(
            f,
            "steam://rungame/730/76561202255233023/+{PREVIEW_MARKER} {tag}{owner}A{}D{}",
            self.a, self.d
        )
    }
}

fn is_digits(v: &str) -> bool {
    !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit())
}
