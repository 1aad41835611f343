//! 协议适配层
//!
//! 每种上游渠道类型实现一个 [`Adaptor`]，负责把规范请求（OpenAI格式）
//! 转成上游格式、发起请求，并把上游响应转换回客户端使用的格式。

pub mod channel;
pub mod convert;
pub mod helper;
pub mod realtime;
pub mod relay_info;
pub mod stream;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;

use crate::dto::{
    AudioSpeechRequest, AudioTranscriptionRequest, ChatCompletionRequest, ClaudeRequest,
    CompletionRequest, EmbeddingRequest, ImageRequest, RerankRequest, Usage,
};
use crate::error::RelayError;
use crate::models::channel::ChannelType;
use crate::services::ttl_cache::TtlCache;

pub use relay_info::{RelayFormat, RelayInfo, RelayMode};

/// 入站请求（已解析）
#[derive(Debug, Clone)]
pub enum RelayRequest {
    Chat(ChatCompletionRequest),
    Claude(ClaudeRequest),
    Completion(CompletionRequest),
    Embedding(EmbeddingRequest),
    Rerank(RerankRequest),
    Image(ImageRequest),
    Speech(AudioSpeechRequest),
    /// 语音转写与翻译共用
    Transcription(AudioTranscriptionRequest),
}

impl RelayRequest {
    pub fn model(&self) -> &str {
        match self {
            RelayRequest::Chat(r) => &r.model,
            RelayRequest::Claude(r) => &r.model,
            RelayRequest::Completion(r) => &r.model,
            RelayRequest::Embedding(r) => &r.model,
            RelayRequest::Rerank(r) => &r.model,
            RelayRequest::Image(r) => &r.model,
            RelayRequest::Speech(r) => &r.model,
            RelayRequest::Transcription(r) => &r.model,
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            RelayRequest::Chat(r) => r.is_stream(),
            RelayRequest::Claude(r) => r.is_stream(),
            RelayRequest::Completion(r) => r.stream.unwrap_or(false),
            _ => false,
        }
    }

    /// 替换模型名后的副本
    pub fn with_model(&self, model: &str) -> Self {
        let mut request = self.clone();
        match &mut request {
            RelayRequest::Chat(r) => r.model = model.to_string(),
            RelayRequest::Claude(r) => r.model = model.to_string(),
            RelayRequest::Completion(r) => r.model = model.to_string(),
            RelayRequest::Embedding(r) => r.model = model.to_string(),
            RelayRequest::Rerank(r) => r.model = model.to_string(),
            RelayRequest::Image(r) => r.model = model.to_string(),
            RelayRequest::Speech(r) => r.model = model.to_string(),
            RelayRequest::Transcription(r) => r.model = model.to_string(),
        }
        request
    }
}

/// 发往上游的请求体
#[derive(Debug, Clone)]
pub enum UpstreamBody {
    Json(Value),
    Multipart(AudioTranscriptionRequest),
}

/// 一次成功尝试的结果
pub struct RelayOutcome {
    pub response: Response,
    /// 非流式响应中解析到的用量；流式用量在流结束时记录日志
    pub usage: Option<Usage>,
    /// 首字耗时，由 [`helper::relay_attempt`] 填写
    pub first_response: Option<Duration>,
    /// 本次请求依次尝试过的渠道，由编排器填写
    pub tried_channels: Vec<i64>,
}

impl RelayOutcome {
    pub fn new(response: Response, usage: Option<Usage>) -> Self {
        Self {
            response,
            usage,
            first_response: None,
            tried_channels: Vec::new(),
        }
    }
}

impl fmt::Debug for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayOutcome")
            .field("status", &self.response.status())
            .field("usage", &self.usage)
            .field("first_response", &self.first_response)
            .field("tried_channels", &self.tried_channels)
            .finish()
    }
}

/// 上游渠道适配器
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// 根据请求上下文准备渠道相关状态，不做I/O
    fn init(&mut self, _info: &RelayInfo) {}

    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError>;

    /// 设置鉴权等请求头
    async fn build_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<(), RelayError>;

    /// 规范请求转上游格式；无法表达的组合返回 `NotImplemented`
    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError>;

    fn client(&self) -> &Client;

    async fn send(
        &self,
        info: &RelayInfo,
        url: &str,
        headers: HeaderMap,
        body: UpstreamBody,
    ) -> Result<reqwest::Response, RelayError> {
        helper::do_request(self.client(), info, url, headers, body).await
    }

    /// 解析2xx响应并生成返回给客户端的响应
    async fn parse_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
    ) -> Result<RelayOutcome, RelayError>;

    /// 该渠道类型静态支持的模型
    fn supported_models(&self) -> Vec<String>;

    fn channel_name(&self) -> &'static str;

    /// 是否原生接受Claude格式请求
    fn accepts_claude_format(&self) -> bool {
        false
    }

    /// Realtime websocket 地址
    fn realtime_url(&self, _info: &RelayInfo) -> Result<String, RelayError> {
        Err(RelayError::NotImplemented(format!(
            "realtime is not supported by {} channels",
            self.channel_name()
        )))
    }
}

/// 适配器工厂，持有共享的HTTP客户端与令牌缓存
pub struct AdaptorRegistry {
    client: Client,
    timeout: Duration,
    proxied_clients: Mutex<HashMap<String, Client>>,
    zhipu_tokens: Arc<TtlCache<String, String>>,
    baidu_tokens: Arc<TtlCache<String, String>>,
}

impl AdaptorRegistry {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            timeout,
            proxied_clients: Mutex::new(HashMap::new()),
            zhipu_tokens: Arc::new(TtlCache::new(Duration::from_secs(
                channel::zhipu::TOKEN_TTL_SECS,
            ))),
            baidu_tokens: Arc::new(TtlCache::new(Duration::from_secs(
                channel::baidu::DEFAULT_TOKEN_TTL_SECS,
            ))),
        })
    }

    /// 按渠道代理设置获取客户端，代理客户端按地址复用
    pub fn client_for(&self, proxy: Option<&str>) -> Result<Client, RelayError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };
        let mut clients = self.proxied_clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = reqwest::Proxy::all(proxy)
            .and_then(|p| Client::builder().timeout(self.timeout).proxy(p).build())
            .map_err(|e| RelayError::bad_request(format!("invalid channel proxy {}: {}", proxy, e)))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    /// 为已绑定渠道的请求创建适配器
    pub fn adaptor_for(&self, info: &RelayInfo) -> Result<Box<dyn Adaptor>, RelayError> {
        let client = self.client_for(info.proxy.as_deref())?;
        let mut adaptor = self.adaptor_for_type(info.channel_type, client).ok_or_else(|| {
            RelayError::NotImplemented(format!(
                "channel type {} has no adaptor",
                info.channel_type
            ))
        })?;
        adaptor.init(info);
        Ok(adaptor)
    }

    /// 不含请求上下文的适配器（用于模型列表）
    pub fn adaptor_for_type(
        &self,
        channel_type: ChannelType,
        client: Client,
    ) -> Option<Box<dyn Adaptor>> {
        let adaptor: Box<dyn Adaptor> = match channel_type {
            ChannelType::OpenAI
            | ChannelType::Azure
            | ChannelType::Custom
            | ChannelType::OpenRouter
            | ChannelType::SiliconFlow
            | ChannelType::Mistral
            | ChannelType::DeepSeek
            | ChannelType::Xai => Box::new(channel::openai::OpenAIAdaptor::new(client, channel_type)),
            ChannelType::Anthropic => Box::new(channel::claude::ClaudeAdaptor::new(client)),
            ChannelType::Gemini => Box::new(channel::gemini::GeminiAdaptor::new(client)),
            ChannelType::Zhipu => Box::new(channel::zhipu::ZhipuAdaptor::new(
                client,
                self.zhipu_tokens.clone(),
            )),
            ChannelType::Baidu => Box::new(channel::baidu::BaiduAdaptor::new(
                client,
                self.baidu_tokens.clone(),
            )),
            ChannelType::Cohere => Box::new(channel::cohere::CohereAdaptor::new(client)),
            ChannelType::Ollama => Box::new(channel::ollama::OllamaAdaptor::new(client)),
            // 需要SigV4/服务账号签名，暂未接入
            ChannelType::Aws | ChannelType::VertexAi => return None,
        };
        Some(adaptor)
    }

    /// 某渠道类型的静态模型目录
    pub fn supported_models(&self, channel_type: ChannelType) -> Vec<String> {
        self.adaptor_for_type(channel_type, self.client.clone())
            .map(|a| a.supported_models())
            .unwrap_or_default()
    }
}

/// 将静态字符串列表转为模型目录
pub(crate) fn model_list(models: &[&str]) -> Vec<String> {
    models.iter().map(|m| m.to_string()).collect()
}
