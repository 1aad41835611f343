use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::error;

use crate::dto::{ChatCompletionChunk, ClaudeResponse, ClaudeStreamEvent, Delta, StreamChoice, Usage};
use crate::error::{ApiError, RelayError};
use crate::relay::channel::set_header;
use crate::relay::convert::{self, DEFAULT_CLAUDE_MAX_TOKENS};
use crate::relay::stream::{self, FrameStream, StreamFrame};
use crate::relay::{
    helper, model_list, Adaptor, RelayFormat, RelayInfo, RelayOutcome, RelayRequest, UpstreamBody,
};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const MODELS: &[&str] = &[
    "claude-3-haiku-20240307",
    "claude-3-opus-20240229",
    "claude-3-5-haiku-20241022",
    "claude-3-5-sonnet-20240620",
    "claude-3-5-sonnet-20241022",
    "claude-3-7-sonnet-20250219",
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
];

pub struct ClaudeAdaptor {
    client: Client,
}

impl ClaudeAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Adaptor for ClaudeAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        Ok(format!("{}/v1/messages", info.base_url))
    }

    async fn build_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        set_header(headers, HeaderName::from_static("x-api-key"), &info.api_key)?;
        set_header(
            headers,
            HeaderName::from_static("anthropic-version"),
            ANTHROPIC_VERSION,
        )?;
        Ok(())
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let mut claude = match request {
            RelayRequest::Claude(claude) => claude.clone(),
            RelayRequest::Chat(chat) => convert::openai_request_to_claude(chat)?,
            _ => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by claude channels",
                    info.relay_mode
                )))
            }
        };
        if claude.max_tokens == 0 {
            claude.max_tokens = DEFAULT_CLAUDE_MAX_TOKENS;
        }
        let body = serde_json::to_value(&claude)
            .map_err(|e| RelayError::bad_request(format!("marshal request body failed: {}", e)))?;
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
        if info.is_stream {
            let frames = match info.relay_format {
                RelayFormat::Claude => native_frames(response),
                RelayFormat::OpenAI => {
                    openai_frames(response, info.request_id.clone(), info.origin_model.clone())
                }
            };
            return stream::respond_stream(info, frames).await;
        }

        let body = helper::read_body(response).await?;
        let parsed: ClaudeResponse = helper::parse_json(&body)?;
        match info.relay_format {
            RelayFormat::Claude => {
                if info.check_empty_response && parsed.text().is_empty() && !parsed.has_tool_use() {
                    return Err(RelayError::EmptyResponse);
                }
                Ok(RelayOutcome::new(
                    helper::json_bytes_response(axum::http::StatusCode::OK, body),
                    parsed
                        .usage
                        .as_ref()
                        .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
                ))
            }
            RelayFormat::OpenAI => {
                helper::chat_response(info, convert::claude_response_to_openai(&parsed))
            }
        }
    }

    fn supported_models(&self) -> Vec<String> {
        model_list(MODELS)
    }

    fn channel_name(&self) -> &'static str {
        "claude"
    }

    fn accepts_claude_format(&self) -> bool {
        true
    }
}

fn stream_error(event: &ClaudeStreamEvent) -> RelayError {
    let error = event.error.clone().unwrap_or(Value::Null);
    let error_type = error["type"].as_str().unwrap_or("api_error").to_string();
    let status = match error_type.as_str() {
        "overloaded_error" => 529,
        "rate_limit_error" => 429,
        _ => 500,
    };
    let message = error["message"]
        .as_str()
        .unwrap_or("claude stream returned an error")
        .to_string();
    RelayError::upstream(status, ApiError::new(message, error_type).with_code(status.to_string()))
}

fn parse_event(data: &str) -> Option<ClaudeStreamEvent> {
    match serde_json::from_str::<ClaudeStreamEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            error!("解析Claude流事件失败: {}, 内容: {}", e, data);
            None
        }
    }
}

/// Claude 客户端：事件原样转发
fn native_frames(response: reqwest::Response) -> FrameStream {
    let mut lines = stream::lines(response);
    Box::pin(async_stream::try_stream! {
        let mut input_tokens = 0u32;
        while let Some(line) = lines.next().await {
            let line = line?;
            let Some(data) = stream::sse_data(&line) else {
                continue;
            };
            let Some(event) = parse_event(data) else {
                continue;
            };
            if event.event_type == "error" {
                Err::<(), RelayError>(stream_error(&event))?;
            }

            let has_content = match event.event_type.as_str() {
                "content_block_delta" => event.delta.as_ref().map_or(false, delta_has_content),
                "content_block_start" => event
                    .content_block
                    .as_ref()
                    .map_or(false, |b| b["type"] == "tool_use"),
                _ => false,
            };
            let usage = match event.event_type.as_str() {
                "message_start" => event
                    .message
                    .as_ref()
                    .and_then(|m| m.usage.as_ref())
                    .map(|u| {
                        input_tokens = u.input_tokens;
                        Usage::new(u.input_tokens, u.output_tokens)
                    }),
                // message_delta 只带输出token
                "message_delta" => event
                    .usage
                    .as_ref()
                    .map(|u| Usage::new(u.input_tokens.max(input_tokens), u.output_tokens)),
                _ => None,
            };
            yield StreamFrame::Raw {
                data: Bytes::from(format!("event: {}\ndata: {}\n\n", event.event_type, data)),
                has_content,
                usage,
            };
        }
    })
}

fn delta_has_content(delta: &Value) -> bool {
    ["text", "partial_json", "thinking"]
        .iter()
        .any(|key| delta[*key].as_str().map_or(false, |t| !t.is_empty()))
}

/// OpenAI 客户端：事件转为规范分片
fn openai_frames(response: reqwest::Response, request_id: String, model: String) -> FrameStream {
    let mut lines = stream::lines(response);
    Box::pin(async_stream::try_stream! {
        let id = format!("chatcmpl-{}", request_id);
        let mut input_tokens = 0u32;
        let mut tool_index: i64 = -1;
        while let Some(line) = lines.next().await {
            let line = line?;
            let Some(data) = stream::sse_data(&line) else {
                continue;
            };
            let Some(event) = parse_event(data) else {
                continue;
            };
            let mut chunk = ChatCompletionChunk::new(id.clone(), model.clone());
            match event.event_type.as_str() {
                "message_start" => {
                    if let Some(usage) = event.message.as_ref().and_then(|m| m.usage.as_ref()) {
                        input_tokens = usage.input_tokens;
                    }
                    continue;
                }
                "content_block_start" => {
                    let Some(block) = event.content_block.as_ref().filter(|b| b["type"] == "tool_use") else {
                        continue;
                    };
                    tool_index += 1;
                    chunk.choices.push(tool_call_choice(json!({
                        "index": tool_index,
                        "id": block["id"],
                        "type": "function",
                        "function": {"name": block["name"], "arguments": ""}
                    })));
                }
                "content_block_delta" => {
                    let delta = event.delta.clone().unwrap_or(Value::Null);
                    if let Some(text) = delta["text"].as_str() {
                        chunk = chunk.with_text(text);
                    } else if let Some(partial) = delta["partial_json"].as_str() {
                        chunk.choices.push(tool_call_choice(json!({
                            "index": tool_index.max(0),
                            "function": {"arguments": partial}
                        })));
                    } else {
                        continue;
                    }
                }
                "message_delta" => {
                    let reason = event
                        .delta
                        .as_ref()
                        .and_then(|d| d["stop_reason"].as_str())
                        .map(convert::claude_stop_to_openai)
                        .unwrap_or("stop");
                    chunk = chunk.with_finish(reason);
                    let output_tokens = event.usage.as_ref().map_or(0, |u| u.output_tokens);
                    chunk.usage = Some(Usage::new(input_tokens, output_tokens));
                }
                "message_stop" => break,
                "error" => Err::<(), RelayError>(stream_error(&event))?,
                _ => continue,
            }
            yield StreamFrame::Chunk(chunk);
        }
    })
}

fn tool_call_choice(call: Value) -> StreamChoice {
    StreamChoice {
        index: 0,
        delta: Delta {
            tool_calls: Some(json!([call])),
            ..Default::default()
        },
        finish_reason: None,
    }
}
