use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::dto::Usage;
use crate::error::RelayError;
use crate::models::channel::ChannelType;
use crate::relay::channel::{set_bearer, set_header};
use crate::relay::stream::{self, FrameStream, StreamFrame};
use crate::relay::{
    helper, model_list, Adaptor, RelayFormat, RelayInfo, RelayMode, RelayOutcome, RelayRequest,
    UpstreamBody,
};

/// Azure 未配置 api_version 时使用的版本
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

const OPENAI_MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4o-mini",
    "o1",
    "o1-mini",
    "o3-mini",
    "text-embedding-ada-002",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "dall-e-3",
    "tts-1",
    "tts-1-hd",
    "whisper-1",
    "gpt-4o-realtime-preview",
];

const DEEPSEEK_MODELS: &[&str] = &["deepseek-chat", "deepseek-reasoner"];

const MISTRAL_MODELS: &[&str] = &[
    "open-mistral-7b",
    "open-mixtral-8x7b",
    "mistral-small-latest",
    "mistral-medium-latest",
    "mistral-large-latest",
    "mistral-embed",
];

const XAI_MODELS: &[&str] = &[
    "grok-3-beta",
    "grok-3-mini-beta",
    "grok-3-fast-beta",
    "grok-3-mini-fast-beta",
    "grok-2",
    "grok-2-vision",
    "grok-2-image",
];

const SILICONFLOW_MODELS: &[&str] = &[
    "deepseek-ai/DeepSeek-V2-Chat",
    "Qwen/Qwen2-72B-Instruct",
    "Qwen/Qwen2-7B-Instruct",
    "THUDM/glm-4-9b-chat",
    "BAAI/bge-large-zh-v1.5",
    "BAAI/bge-reranker-v2-m3",
    "FunAudioLLM/SenseVoiceSmall",
];

/// OpenAI 及所有兼容协议的渠道
pub struct OpenAIAdaptor {
    client: Client,
    channel_type: ChannelType,
}

impl OpenAIAdaptor {
    pub fn new(client: Client, channel_type: ChannelType) -> Self {
        Self {
            client,
            channel_type,
        }
    }

    fn azure_url(&self, info: &RelayInfo) -> String {
        // 部署名不允许出现 '.'
        let deployment = info.upstream_model.replace('.', "");
        let suffix = info
            .relay_mode
            .openai_path()
            .trim_start_matches("/v1/");
        let api_version = info
            .api_version
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(DEFAULT_AZURE_API_VERSION);
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            info.base_url, deployment, suffix, api_version
        )
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value)
        .map_err(|e| RelayError::bad_request(format!("marshal request body failed: {}", e)))
}

fn require_base_url(info: &RelayInfo) -> Result<(), RelayError> {
    if info.base_url.is_empty() {
        return Err(RelayError::bad_request(format!(
            "channel #{} has no base_url configured",
            info.channel_id
        )));
    }
    Ok(())
}

/// 把 http(s) 地址换成 ws(s)
pub(crate) fn websocket_base(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        require_base_url(info)?;
        let url = match self.channel_type {
            ChannelType::Azure => self.azure_url(info),
            ChannelType::Custom => info.base_url.replace("{model}", &info.upstream_model),
            _ => format!("{}{}", info.base_url, info.relay_mode.openai_path()),
        };
        Ok(url)
    }

    async fn build_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        match self.channel_type {
            ChannelType::Azure => {
                set_header(headers, HeaderName::from_static("api-key"), &info.api_key)?;
            }
            ChannelType::OpenRouter => {
                set_bearer(headers, &info.api_key)?;
                set_header(
                    headers,
                    HeaderName::from_static("http-referer"),
                    "https://github.com/relay-gateway",
                )?;
                set_header(headers, HeaderName::from_static("x-title"), "relay-gateway")?;
            }
            _ => set_bearer(headers, &info.api_key)?,
        }
        if info.relay_mode == RelayMode::Realtime {
            set_header(headers, HeaderName::from_static("openai-beta"), "realtime=v1")?;
        }
        Ok(())
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request {
            RelayRequest::Chat(chat) => {
                let mut chat = chat.clone();
                // 流式时要求上游在最后一帧带上用量
                if chat.is_stream() && chat.stream_options.is_none() {
                    chat.stream_options = Some(json!({"include_usage": true}));
                }
                to_json(&chat)?
            }
            RelayRequest::Completion(r) => to_json(r)?,
            RelayRequest::Embedding(r) => to_json(r)?,
            RelayRequest::Rerank(r) => to_json(r)?,
            RelayRequest::Image(r) => to_json(r)?,
            RelayRequest::Speech(r) => to_json(r)?,
            RelayRequest::Transcription(r) => return Ok(UpstreamBody::Multipart(r.clone())),
            RelayRequest::Claude(_) => {
                return Err(RelayError::NotImplemented(format!(
                    "claude format is not accepted by {} channels without conversion, request {}",
                    self.channel_name(),
                    info.request_id
                )))
            }
        };
        Ok(UpstreamBody::Json(body))
    }

    fn client(&self) -> &Client {
        &self.client
    }

    async fn parse_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
    ) -> Result<RelayOutcome, RelayError> {
        match info.relay_mode {
            RelayMode::ChatCompletions if info.is_stream => {
                let passthrough = info.relay_format == RelayFormat::OpenAI;
                stream::respond_stream(info, stream::openai_frames(response, passthrough)).await
            }
            RelayMode::ChatCompletions => helper::openai_chat_response(info, response).await,
            RelayMode::Completions if info.is_stream => {
                stream::respond_stream(info, completion_frames(response)).await
            }
            RelayMode::AudioSpeech => helper::binary_passthrough(response),
            _ => helper::passthrough_response(info, response).await,
        }
    }

    fn supported_models(&self) -> Vec<String> {
        match self.channel_type {
            ChannelType::OpenAI | ChannelType::Azure => model_list(OPENAI_MODELS),
            ChannelType::DeepSeek => model_list(DEEPSEEK_MODELS),
            ChannelType::Mistral => model_list(MISTRAL_MODELS),
            ChannelType::Xai => model_list(XAI_MODELS),
            ChannelType::SiliconFlow => model_list(SILICONFLOW_MODELS),
            _ => Vec::new(),
        }
    }

    fn channel_name(&self) -> &'static str {
        match self.channel_type {
            ChannelType::Azure => "azure",
            ChannelType::Custom => "custom",
            ChannelType::OpenRouter => "openrouter",
            ChannelType::SiliconFlow => "siliconflow",
            ChannelType::Mistral => "mistral",
            ChannelType::DeepSeek => "deepseek",
            ChannelType::Xai => "xai",
            _ => "openai",
        }
    }

    fn realtime_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        require_base_url(info)?;
        let base = websocket_base(&info.base_url);
        match self.channel_type {
            ChannelType::OpenAI => Ok(format!(
                "{}/v1/realtime?model={}",
                base, info.upstream_model
            )),
            ChannelType::Azure => Ok(format!(
                "{}/openai/realtime?api-version={}&deployment={}",
                base,
                info.api_version
                    .as_deref()
                    .unwrap_or(DEFAULT_AZURE_API_VERSION),
                info.upstream_model
            )),
            _ => Err(RelayError::NotImplemented(format!(
                "realtime is not supported by {} channels",
                self.channel_name()
            ))),
        }
    }
}

/// 旧版文本补全的流，原样转发，以 `text` 字段判断是否有内容
fn completion_frames(response: reqwest::Response) -> FrameStream {
    let mut lines = stream::lines(response);
    Box::pin(async_stream::try_stream! {
        while let Some(line) = lines.next().await {
            let line = line?;
            let Some(data) = stream::sse_data(&line) else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(value) => value,
                Err(e) => {
                    error!("解析补全分片失败: {}, 内容: {}", e, data);
                    continue;
                }
            };
            let has_content = value["choices"]
                .as_array()
                .map_or(false, |choices| {
                    choices
                        .iter()
                        .any(|c| c["text"].as_str().map_or(false, |t| !t.is_empty()))
                });
            let usage = value
                .get("usage")
                .cloned()
                .and_then(|u| serde_json::from_value::<Usage>(u).ok());
            yield StreamFrame::Raw {
                data: Bytes::from(format!("data: {}\n\n", data)),
                has_content,
                usage,
            };
        }
    })
}
