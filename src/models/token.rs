use serde::{Deserialize, Serialize};

/// 客户端令牌（由外部账户系统维护，核心只读）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    pub id: i64,
    pub name: String,
    /// 令牌可使用的渠道分组
    pub group: String,
    pub enabled: bool,
    /// 令牌固定使用的渠道，设置后不做重试
    pub channel_id: Option<i64>,
}

impl TokenInfo {
    pub fn is_pinned(&self) -> bool {
        self.channel_id.is_some()
    }
}
