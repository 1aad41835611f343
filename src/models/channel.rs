use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 渠道类型（与数据库中的整数编码一一对应）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "i32", into = "i32")]
pub enum ChannelType {
    OpenAI,
    Azure,
    Custom,
    Anthropic,
    Baidu,
    OpenRouter,
    Gemini,
    Zhipu,
    Ollama,
    Aws,
    Cohere,
    VertexAi,
    SiliconFlow,
    Mistral,
    DeepSeek,
    Xai,
}

impl ChannelType {
    pub fn code(self) -> i32 {
        match self {
            ChannelType::OpenAI => 1,
            ChannelType::Azure => 3,
            ChannelType::Custom => 8,
            ChannelType::Anthropic => 14,
            ChannelType::Baidu => 15,
            ChannelType::OpenRouter => 20,
            ChannelType::Gemini => 24,
            ChannelType::Zhipu => 26,
            ChannelType::Ollama => 30,
            ChannelType::Aws => 33,
            ChannelType::Cohere => 34,
            ChannelType::VertexAi => 41,
            ChannelType::SiliconFlow => 40,
            ChannelType::Mistral => 42,
            ChannelType::DeepSeek => 43,
            ChannelType::Xai => 48,
        }
    }

    /// 渠道未配置 base_url 时使用的默认地址
    pub fn default_base_url(self) -> &'static str {
        match self {
            ChannelType::OpenAI | ChannelType::Custom => "https://api.openai.com",
            ChannelType::Azure => "",
            ChannelType::Anthropic => "https://api.anthropic.com",
            ChannelType::Baidu => "https://aip.baidubce.com",
            ChannelType::OpenRouter => "https://openrouter.ai/api",
            ChannelType::Gemini => "https://generativelanguage.googleapis.com",
            ChannelType::Zhipu => "https://open.bigmodel.cn",
            ChannelType::Ollama => "http://localhost:11434",
            ChannelType::Aws => "",
            ChannelType::Cohere => "https://api.cohere.ai",
            ChannelType::VertexAi => "",
            ChannelType::SiliconFlow => "https://api.siliconflow.cn",
            ChannelType::Mistral => "https://api.mistral.ai",
            ChannelType::DeepSeek => "https://api.deepseek.com",
            ChannelType::Xai => "https://api.x.ai",
        }
    }
}

impl TryFrom<i32> for ChannelType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        let channel_type = match code {
            1 => ChannelType::OpenAI,
            3 => ChannelType::Azure,
            8 => ChannelType::Custom,
            14 => ChannelType::Anthropic,
            15 => ChannelType::Baidu,
            20 => ChannelType::OpenRouter,
            24 => ChannelType::Gemini,
            26 => ChannelType::Zhipu,
            30 => ChannelType::Ollama,
            33 => ChannelType::Aws,
            34 => ChannelType::Cohere,
            41 => ChannelType::VertexAi,
            40 => ChannelType::SiliconFlow,
            42 => ChannelType::Mistral,
            43 => ChannelType::DeepSeek,
            48 => ChannelType::Xai,
            other => return Err(format!("Unknown channel type: {}", other)),
        };
        Ok(channel_type)
    }
}

impl From<ChannelType> for i32 {
    fn from(channel_type: ChannelType) -> Self {
        channel_type.code()
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// 渠道状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    /// 启用
    Enabled,
    /// 管理员手动禁用
    ManuallyDisabled,
    /// 健康管理器自动禁用
    AutoDisabled,
}

impl ChannelStatus {
    pub fn code(self) -> i64 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ChannelStatus::Enabled),
            2 => Some(ChannelStatus::ManuallyDisabled),
            3 => Some(ChannelStatus::AutoDisabled),
            _ => None,
        }
    }
}

/// 渠道附加设置（数据库中以JSON保存）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelSetting {
    /// Azure 的 api-version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// 出站代理，支持 http(s):// 与 socks5://
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

/// 上游渠道：一条凭证 + 端点记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub key: String,
    /// 该渠道可服务的模型
    pub models: Vec<String>,
    /// 该渠道所属的分组
    pub groups: Vec<String>,
    /// 优先级，数值越大越先被选中
    pub priority: i64,
    /// 同优先级内的加权随机权重
    pub weight: u32,
    /// 是否允许健康管理器自动禁用
    pub auto_ban: bool,
    /// 渠道级模型重命名
    pub model_mapping: Option<String>,
    pub setting: ChannelSetting,
    /// 健康探测使用的模型
    pub test_model: Option<String>,
    pub created_time: i64,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// 实际使用的 base_url，未配置时回退到渠道类型默认值
    pub fn effective_base_url(&self) -> String {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => self.channel_type.default_base_url().to_string(),
        }
    }

    /// 解析渠道级模型映射，返回该渠道对 `model` 的上游名称
    pub fn map_model(&self, model: &str) -> Result<Option<String>, serde_json::Error> {
        let raw = match self.model_mapping.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() && raw != "{}" => raw,
            _ => return Ok(None),
        };
        let mapping: HashMap<String, String> = serde_json::from_str(raw)?;
        Ok(mapping
            .get(model)
            .filter(|target| !target.trim().is_empty())
            .cloned())
    }

    /// 健康探测使用的模型：优先 test_model，其次第一个声明的模型
    pub fn probe_model(&self) -> Option<&str> {
        self.test_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.models.first().map(String::as_str))
    }
}

/// 将逗号分隔的字段拆成列表
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 测试用渠道
#[cfg(test)]
pub(crate) fn test_channel(id: i64) -> Channel {
    Channel {
        id,
        name: format!("channel-{}", id),
        channel_type: ChannelType::OpenAI,
        status: ChannelStatus::Enabled,
        base_url: None,
        key: "sk-test".to_string(),
        models: vec!["gpt-4".to_string()],
        groups: vec!["default".to_string()],
        priority: 0,
        weight: 1,
        auto_ban: true,
        model_mapping: None,
        setting: ChannelSetting::default(),
        test_model: None,
        created_time: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn channel(id: i64) -> Channel {
        test_channel(id)
    }

    #[test]
    fn channel_type_codes_round_trip_through_serde() {
        let json = serde_json::to_string(&ChannelType::Gemini).unwrap();
        assert_eq!(json, "24");
        let parsed: ChannelType = serde_json::from_str("14").unwrap();
        assert_eq!(parsed, ChannelType::Anthropic);
        assert!(serde_json::from_str::<ChannelType>("999").is_err());
    }

    #[test]
    fn effective_base_url_falls_back_to_type_default() {
        let mut ch = channel(1);
        assert_eq!(ch.effective_base_url(), "https://api.openai.com");
        ch.base_url = Some("https://proxy.example.com/".to_string());
        assert_eq!(ch.effective_base_url(), "https://proxy.example.com");
    }

    #[test]
    fn channel_model_mapping_renames_only_listed_models() {
        let mut ch = channel(1);
        ch.model_mapping = Some(r#"{"gpt-4":"gpt-4-0613"}"#.to_string());
        assert_eq!(ch.map_model("gpt-4").unwrap(), Some("gpt-4-0613".to_string()));
        assert_eq!(ch.map_model("gpt-3.5-turbo").unwrap(), None);

        ch.model_mapping = Some("not json".to_string());
        assert!(ch.map_model("gpt-4").is_err());
    }

    #[test]
    fn split_csv_trims_and_drops_blanks() {
        assert_eq!(split_csv(" a, b ,,c "), vec!["a", "b", "c"]);
    }
}
