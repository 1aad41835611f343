use std::convert::Infallible;
use std::pin::Pin;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::dto::{ChatCompletionChunk, Usage};
use crate::error::RelayError;
use crate::relay::relay_info::{RelayFormat, RelayInfo};
use crate::relay::{convert, RelayOutcome};

/// 上游流中的一帧
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// 规范分片，由编码器转换为客户端格式
    Chunk(ChatCompletionChunk),
    /// 已是客户端格式的原始数据，原样写出
    Raw {
        data: Bytes,
        has_content: bool,
        usage: Option<Usage>,
    },
}

impl StreamFrame {
    pub fn has_content(&self) -> bool {
        match self {
            StreamFrame::Chunk(chunk) => chunk.has_content(),
            StreamFrame::Raw { has_content, .. } => *has_content,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            StreamFrame::Chunk(chunk) => chunk.usage,
            StreamFrame::Raw { usage, .. } => *usage,
        }
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, RelayError>> + Send>>;

/// 按行切分字节流，跨块的半行会被缓存
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// 将上游响应体解码为非空行
pub fn lines(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>> {
    let mut body = response.bytes_stream();
    Box::pin(async_stream::try_stream! {
        let mut decoder = LineDecoder::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RelayError::Transport(e.to_string()))?;
            for line in decoder.push(&chunk) {
                yield line;
            }
        }
        if let Some(line) = decoder.finish() {
            yield line;
        }
    })
}

/// 取出SSE的 `data:` 内容
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// OpenAI兼容上游的SSE流
///
/// `passthrough` 为真时原样转发每一行（保留上游的未知字段），否则产出规范分片。
pub fn openai_frames(response: reqwest::Response, passthrough: bool) -> FrameStream {
    let mut lines = lines(response);
    Box::pin(async_stream::try_stream! {
        while let Some(line) = lines.next().await {
            let line = line?;
            let Some(data) = sse_data(&line) else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }
            let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!("解析流式分片失败: {}, 内容: {}", e, data);
                    continue;
                }
            };
            if passthrough {
                yield StreamFrame::Raw {
                    data: Bytes::from(format!("data: {}\n\n", data)),
                    has_content: chunk.has_content(),
                    usage: chunk.usage,
                };
            } else {
                yield StreamFrame::Chunk(chunk);
            }
        }
    })
}

/// 把规范分片编码为客户端格式
pub struct FrameEncoder {
    format: RelayFormat,
    model: String,
    message_id: String,
    started: bool,
    raw_seen: bool,
    stop_reason: Option<String>,
}

impl FrameEncoder {
    pub fn new(format: RelayFormat, model: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            format,
            model: model.into(),
            message_id: message_id.into(),
            started: false,
            raw_seen: false,
            stop_reason: None,
        }
    }

    pub fn encode(&mut self, frame: StreamFrame) -> Bytes {
        match frame {
            StreamFrame::Raw { data, .. } => {
                self.raw_seen = true;
                data
            }
            StreamFrame::Chunk(chunk) => match self.format {
                RelayFormat::OpenAI => openai_event(&chunk),
                RelayFormat::Claude => self.encode_claude(&chunk),
            },
        }
    }

    fn encode_claude(&mut self, chunk: &ChatCompletionChunk) -> Bytes {
        let mut out = String::new();
        if !self.started {
            self.started = true;
            out.push_str(&claude_event(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0}
                    }
                }),
            ));
            out.push_str(&claude_event(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
        }
        for choice in &chunk.choices {
            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                out.push_str(&claude_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }
            if let Some(reason) = &choice.finish_reason {
                self.stop_reason = Some(convert::openai_stop_to_claude(reason).to_string());
            }
        }
        Bytes::from(out)
    }

    /// 流中途出错时写给客户端的错误帧
    pub fn error(&self, err: &RelayError) -> Bytes {
        let message = err.to_string();
        match self.format {
            RelayFormat::OpenAI => Bytes::from(format!(
                "data: {}\n\n",
                json!({"error": {"message": message, "type": "upstream_error"}})
            )),
            RelayFormat::Claude => Bytes::from(claude_event(
                "error",
                &json!({"type": "error", "error": {"type": "api_error", "message": message}}),
            )),
        }
    }

    /// 结束帧
    pub fn finish(&mut self, usage: Option<Usage>) -> Bytes {
        match self.format {
            RelayFormat::OpenAI => Bytes::from_static(b"data: [DONE]\n\n"),
            // 原生Claude流自带 message_stop
            RelayFormat::Claude if self.raw_seen => Bytes::new(),
            RelayFormat::Claude => {
                let mut out = String::new();
                if !self.started {
                    out.push_str(&String::from_utf8_lossy(
                        &self.encode_claude(&ChatCompletionChunk::default()),
                    ));
                }
                let usage = usage.unwrap_or_default();
                out.push_str(&claude_event(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": 0}),
                ));
                out.push_str(&claude_event(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": self.stop_reason.as_deref().unwrap_or("end_turn"),
                            "stop_sequence": null
                        },
                        "usage": {
                            "input_tokens": usage.prompt_tokens,
                            "output_tokens": usage.completion_tokens
                        }
                    }),
                ));
                out.push_str(&claude_event("message_stop", &json!({"type": "message_stop"})));
                Bytes::from(out)
            }
        }
    }
}

fn openai_event(chunk: &ChatCompletionChunk) -> Bytes {
    let payload = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", payload))
}

pub fn claude_event(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// 等待首个有内容的帧后再提交响应，用于识别空响应
pub async fn respond_stream(
    info: &mut RelayInfo,
    mut frames: FrameStream,
) -> Result<RelayOutcome, RelayError> {
    let mut buffered = Vec::new();
    loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                let has_content = frame.has_content();
                buffered.push(frame);
                if has_content {
                    info.mark_first_response();
                    break;
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                if info.check_empty_response {
                    return Err(RelayError::EmptyResponse);
                }
                break;
            }
        }
    }

    let mut encoder = FrameEncoder::new(
        info.relay_format,
        info.origin_model.clone(),
        format!("msg_{}", info.request_id),
    );
    let request_id = info.request_id.clone();
    let channel_id = info.channel_id;

    let body = async_stream::stream! {
        let mut usage: Option<Usage> = None;
        for frame in buffered {
            usage = frame.usage().or(usage);
            yield Ok::<Bytes, Infallible>(encoder.encode(frame));
        }
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    usage = frame.usage().or(usage);
                    yield Ok(encoder.encode(frame));
                }
                Err(e) => {
                    error!("流式响应中断 [{}]: channel_id={}, error={}", request_id, channel_id, e);
                    yield Ok(encoder.error(&e));
                    break;
                }
            }
        }
        yield Ok(encoder.finish(usage));
        info!("流式响应结束 [{}]: channel_id={}, usage={:?}", request_id, channel_id, usage);
    };

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body))
        .map_err(|e| RelayError::Transport(e.to_string()))?;

    Ok(RelayOutcome::new(response, None))
}
