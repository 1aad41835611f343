use std::time::{Duration, Instant};

use crate::models::channel::{Channel, ChannelType};
use crate::models::token::TokenInfo;

/// 客户端使用的协议格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFormat {
    OpenAI,
    Claude,
}

/// 中转的接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Rerank,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Realtime,
}

impl RelayMode {
    /// OpenAI兼容上游上的路径
    pub fn openai_path(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Rerank => "/v1/rerank",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::Realtime => "/v1/realtime",
        }
    }
}

/// 单个请求的中转上下文
///
/// 每个入站请求创建一次；每次尝试通过 [`RelayInfo::bind_channel`] 得到绑定了渠道的副本。
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub relay_mode: RelayMode,
    pub relay_format: RelayFormat,
    pub group: String,
    pub token_id: i64,
    /// 令牌固定的渠道
    pub pinned_channel: Option<i64>,
    /// 客户端看到的模型名
    pub origin_model: String,
    /// 实际发往上游的模型名
    pub upstream_model: String,
    pub is_model_mapped: bool,
    pub is_stream: bool,
    /// 自动重试开启时，空响应按失败处理
    pub check_empty_response: bool,
    pub start_time: Instant,
    pub first_response_time: Option<Instant>,

    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    pub api_version: Option<String>,
    pub proxy: Option<String>,
    pub auto_ban: bool,
}

impl RelayInfo {
    pub fn new(
        request_id: impl Into<String>,
        relay_mode: RelayMode,
        relay_format: RelayFormat,
        token: &TokenInfo,
        origin_model: impl Into<String>,
        is_stream: bool,
    ) -> Self {
        let origin_model = origin_model.into();
        Self {
            request_id: request_id.into(),
            relay_mode,
            relay_format,
            group: token.group.clone(),
            token_id: token.id,
            pinned_channel: token.channel_id,
            upstream_model: origin_model.clone(),
            origin_model,
            is_model_mapped: false,
            is_stream,
            check_empty_response: false,
            start_time: Instant::now(),
            first_response_time: None,
            channel_id: 0,
            channel_type: ChannelType::OpenAI,
            channel_name: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            api_version: None,
            proxy: None,
            auto_ban: false,
        }
    }

    /// 记录虚拟模型解析结果
    pub fn set_resolved_model(&mut self, upstream_model: impl Into<String>) {
        let upstream_model = upstream_model.into();
        self.is_model_mapped = upstream_model != self.origin_model;
        self.upstream_model = upstream_model;
    }

    /// 绑定一次尝试使用的渠道，并应用渠道级模型重命名
    pub fn bind_channel(&self, channel: &Channel, upstream_model: &str) -> Self {
        let mut info = self.clone();
        info.channel_id = channel.id;
        info.channel_type = channel.channel_type;
        info.channel_name = channel.name.clone();
        info.base_url = channel.effective_base_url();
        info.api_key = channel.key.clone();
        info.api_version = channel.setting.api_version.clone();
        info.proxy = channel.setting.proxy.clone().filter(|p| !p.trim().is_empty());
        info.auto_ban = channel.auto_ban;
        info.upstream_model = upstream_model.to_string();
        info.is_model_mapped = upstream_model != info.origin_model;
        info.first_response_time = None;
        info
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_channel.is_some()
    }

    pub fn mark_first_response(&mut self) {
        if self.first_response_time.is_none() {
            self.first_response_time = Some(Instant::now());
        }
    }

    /// 首字耗时
    pub fn first_response_latency(&self) -> Option<Duration> {
        self.first_response_time
            .map(|t| t.saturating_duration_since(self.start_time))
    }
}

#[cfg(test)]
pub(crate) fn test_info(mode: RelayMode, format: RelayFormat) -> RelayInfo {
    let token = TokenInfo {
        id: 1,
        name: "test".into(),
        group: "default".into(),
        enabled: true,
        channel_id: None,
    };
    RelayInfo::new("req-test", mode, format, &token, "gpt-4", false)
}
