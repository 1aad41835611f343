use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::dto::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, EmbeddingData,
    EmbeddingResponse, Usage,
};
use crate::error::{ApiError, RelayError};
use crate::relay::channel::ensure_text_chat;
use crate::relay::stream::{self, FrameStream, StreamFrame};
use crate::relay::{
    helper, model_list, Adaptor, RelayInfo, RelayMode, RelayOutcome, RelayRequest, UpstreamBody,
};
use crate::services::ttl_cache::TtlCache;

/// 百度 access_token 默认有效期（30天），以接口返回的 expires_in 为准
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;

const TOKEN_REFRESH_MARGIN_SECS: u64 = 3600;

const MODELS: &[&str] = &[
    "ERNIE-4.0-8K",
    "ERNIE-3.5-8K",
    "ERNIE-3.5-8K-0205",
    "ERNIE-3.5-8K-1222",
    "ERNIE-Bot-8K",
    "ERNIE-3.5-4K-0205",
    "ERNIE-Speed-8K",
    "ERNIE-Speed-128K",
    "ERNIE-Lite-8K-0922",
    "ERNIE-Lite-8K-0308",
    "ERNIE-Tiny-8K",
    "BLOOMZ-7B",
    "Embedding-V1",
    "bge-large-zh",
    "bge-large-en",
    "tao-8k",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaiduMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BaiduChatRequest {
    pub messages: Vec<BaiduMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BaiduChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_end: bool,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct BaiduAdaptor {
    client: Client,
    tokens: Arc<TtlCache<String, String>>,
}

impl BaiduAdaptor {
    pub fn new(client: Client, tokens: Arc<TtlCache<String, String>>) -> Self {
        Self { client, tokens }
    }

    /// `client_id|client_secret` 换取 access_token；不含 `|` 的密钥直接视为 access_token
    async fn access_token(&self, base_url: &str, api_key: &str) -> Result<String, RelayError> {
        let Some((client_id, client_secret)) = api_key.split_once('|') else {
            return Ok(api_key.to_string());
        };
        if let Some(token) = self.tokens.get(&api_key.to_string()) {
            return Ok(token);
        }

        let response = self
            .client
            .post(format!("{}/oauth/2.0/token", base_url))
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("get baidu access token failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = helper::read_body(response).await?;
        let parsed: AccessTokenResponse = helper::parse_json(&body)?;

        if let Some(err) = parsed.error.filter(|e| !e.is_empty()) {
            let message = parsed.error_description.unwrap_or_else(|| err.clone());
            return Err(RelayError::upstream(
                if status == 200 { 401 } else { status },
                ApiError::new(message, "baidu_auth_error").with_code(err),
            ));
        }
        if parsed.access_token.is_empty() {
            return Err(RelayError::upstream(
                500,
                ApiError::new("baidu returned an empty access token", "baidu_auth_error"),
            ));
        }

        let ttl = if parsed.expires_in > 0 {
            parsed.expires_in
        } else {
            DEFAULT_TOKEN_TTL_SECS
        };
        self.tokens.insert_with_ttl(
            api_key.to_string(),
            parsed.access_token.clone(),
            Duration::from_secs(ttl.saturating_sub(TOKEN_REFRESH_MARGIN_SECS).max(60)),
        );
        info!("百度 access_token 已刷新, 有效期 {} 秒", ttl);
        Ok(parsed.access_token)
    }
}

/// 模型名到文心接口路径的对应关系，未列出的模型使用小写名
pub fn endpoint_suffix(model: &str) -> String {
    let suffix = match model {
        "ERNIE-4.0-8K" => "completions_pro",
        "ERNIE-3.5-8K" => "completions",
        "ERNIE-Bot-8K" => "ernie_bot_8k",
        "ERNIE-Speed-8K" => "ernie_speed",
        "ERNIE-Lite-8K-0922" => "eb-instant",
        "BLOOMZ-7B" => "bloomz_7b1",
        "Embedding-V1" => "embedding-v1",
        "bge-large-zh" => "bge_large_zh",
        "bge-large-en" => "bge_large_en",
        "tao-8k" => "tao_8k",
        other => return other.to_lowercase(),
    };
    suffix.to_string()
}

pub fn chat_to_baidu(request: &ChatCompletionRequest) -> Result<BaiduChatRequest, RelayError> {
    ensure_text_chat(request, "baidu")?;
    let mut system = Vec::new();
    let mut messages = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        if message.role == "system" || message.role == "developer" {
            system.push(message.content_text());
            continue;
        }
        let role = if message.role == "assistant" {
            "assistant"
        } else {
            "user"
        };
        messages.push(BaiduMessage {
            role: role.to_string(),
            content: message.content_text(),
        });
    }
    let stop = request.stop_sequences();
    Ok(BaiduChatRequest {
        messages,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.is_stream(),
        system: (!system.is_empty()).then(|| system.join("\n")),
        max_output_tokens: request.max_tokens,
        stop: (!stop.is_empty()).then_some(stop),
    })
}

fn check_embedded_error(value: &Value) -> Result<(), RelayError> {
    match helper::embedded_error(value) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl Adaptor for BaiduAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let kind = match info.relay_mode {
            RelayMode::ChatCompletions => "chat",
            RelayMode::Embeddings => "embeddings",
            mode => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by baidu channels",
                    mode
                )))
            }
        };
        Ok(format!(
            "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/{}/{}",
            info.base_url,
            kind,
            endpoint_suffix(&info.upstream_model)
        ))
    }

    async fn build_headers(
        &self,
        _info: &RelayInfo,
        _headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        // 鉴权走 URL 上的 access_token
        Ok(())
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request {
            RelayRequest::Chat(chat) => serde_json::to_value(chat_to_baidu(chat)?),
            RelayRequest::Embedding(embedding) => {
                Ok(serde_json::json!({"input": embedding.parse_input()}))
            }
            _ => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by baidu channels",
                    info.relay_mode
                )))
            }
        }
        .map_err(|e| RelayError::bad_request(format!("marshal request body failed: {}", e)))?;
        Ok(UpstreamBody::Json(body))
    }

    fn client(&self) -> &Client {
        &self.client
    }

    async fn send(
        &self,
        info: &RelayInfo,
        url: &str,
        headers: HeaderMap,
        body: UpstreamBody,
    ) -> Result<reqwest::Response, RelayError> {
        let token = self.access_token(&info.base_url, &info.api_key).await?;
        let url = format!("{}?access_token={}", url, token);
        helper::do_request(&self.client, info, &url, headers, body).await
    }

    async fn parse_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
    ) -> Result<RelayOutcome, RelayError> {
        if info.relay_mode == RelayMode::ChatCompletions && info.is_stream {
            let frames = baidu_frames(
                response,
                format!("chatcmpl-{}", info.request_id),
                info.origin_model.clone(),
            );
            return stream::respond_stream(info, frames).await;
        }

        let body = helper::read_body(response).await?;
        let value: Value = helper::parse_json(&body)?;
        check_embedded_error(&value)?;

        if info.relay_mode == RelayMode::Embeddings {
            let data: Vec<EmbeddingData> = value["data"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, item)| EmbeddingData {
                            object: "embedding".to_string(),
                            index,
                            embedding: serde_json::from_value(item["embedding"].clone())
                                .unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            if data.is_empty() && info.check_empty_response {
                return Err(RelayError::EmptyResponse);
            }
            let usage = serde_json::from_value::<Usage>(value["usage"].clone()).unwrap_or_default();
            let response = EmbeddingResponse {
                object: "list".to_string(),
                data,
                model: info.origin_model.clone(),
                usage,
            };
            return Ok(RelayOutcome::new(
                axum::response::IntoResponse::into_response(axum::Json(response)),
                Some(usage),
            ));
        }

        let parsed: BaiduChatResponse = serde_json::from_value(value).unwrap_or_default();
        let converted = ChatCompletionResponse::single(
            if parsed.id.is_empty() {
                format!("chatcmpl-{}", info.request_id)
            } else {
                parsed.id
            },
            info.origin_model.clone(),
            parsed.result,
            Some("stop".to_string()),
            parsed.usage,
        );
        helper::chat_response(info, converted)
    }

    fn supported_models(&self) -> Vec<String> {
        model_list(MODELS)
    }

    fn channel_name(&self) -> &'static str {
        "baidu"
    }
}

fn baidu_frames(response: reqwest::Response, id: String, model: String) -> FrameStream {
    let mut lines = stream::lines(response);
    Box::pin(async_stream::try_stream! {
        while let Some(line) = lines.next().await {
            let line = line?;
            // 出错时百度直接返回一个JSON对象而不是SSE
            let data = stream::sse_data(&line).unwrap_or(line.as_str());
            let value: Value = match serde_json::from_str(data) {
                Ok(value) => value,
                Err(e) => {
                    error!("解析百度流分片失败: {}, 内容: {}", e, data);
                    continue;
                }
            };
            check_embedded_error(&value)?;
            let parsed: BaiduChatResponse = serde_json::from_value(value).unwrap_or_default();
            let mut chunk = ChatCompletionChunk::new(id.clone(), model.clone());
            if !parsed.result.is_empty() {
                chunk = chunk.with_text(parsed.result);
            }
            if parsed.is_end {
                chunk = chunk.with_finish("stop");
                chunk.usage = parsed.usage;
            }
            yield StreamFrame::Chunk(chunk);
            if parsed.is_end {
                break;
            }
        }
    })
}
