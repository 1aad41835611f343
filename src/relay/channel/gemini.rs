use std::collections::HashMap;

use async_trait::async_trait;
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::dto::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Delta, EmbeddingData,
    EmbeddingRequest, EmbeddingResponse, Message, StreamChoice, Usage,
};
use crate::error::RelayError;
use crate::relay::channel::set_header;
use crate::relay::stream::{self, FrameStream, StreamFrame};
use crate::relay::{
    helper, model_list, Adaptor, RelayInfo, RelayMode, RelayOutcome, RelayRequest, UpstreamBody,
};

pub const DEFAULT_API_VERSION: &str = "v1beta";

const MODELS: &[&str] = &[
    "gemini-1.5-pro",
    "gemini-1.5-flash",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "text-embedding-004",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeminiChatRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChatResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

impl GeminiChatResponse {
    fn usage(&self) -> Option<Usage> {
        self.usage_metadata
            .as_ref()
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
    }

    /// 第一个候选的文本与函数调用
    fn first_output(&self) -> (String, Vec<Value>, Option<String>) {
        let Some(candidate) = self.candidates.first() else {
            return (String::new(), Vec::new(), None);
        };
        let mut text = String::new();
        let mut calls = Vec::new();
        for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                calls.push(json!({
                    "id": format!("call_{}", calls.len()),
                    "type": "function",
                    "function": {
                        "name": call["name"],
                        "arguments": call.get("args").map(Value::to_string).unwrap_or_else(|| "{}".into()),
                    }
                }));
            }
        }
        let finish = candidate
            .finish_reason
            .as_deref()
            .map(|r| finish_reason(r, !calls.is_empty()).to_string());
        (text, calls, finish)
    }
}

fn finish_reason(reason: &str, has_calls: bool) -> &'static str {
    match reason {
        "STOP" if has_calls => "tool_calls",
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        _ => "content_filter",
    }
}

pub struct GeminiAdaptor {
    client: Client,
}

impl GeminiAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// 规范聊天请求转 Gemini generateContent 请求
pub fn chat_to_gemini(request: &ChatCompletionRequest) -> Result<GeminiChatRequest, RelayError> {
    let mut system = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();
    // tool 消息只带 tool_call_id，Gemini 需要函数名
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        let (role, parts) = match message.role.as_str() {
            "system" | "developer" => {
                system.push(json!({"text": message.content_text()}));
                continue;
            }
            "assistant" => ("model", assistant_parts(message, &mut call_names)),
            "tool" => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let name = call_names.get(&id).cloned().unwrap_or(id);
                (
                    "user",
                    vec![json!({
                        "functionResponse": {
                            "name": name,
                            "response": {"content": message.content_text()}
                        }
                    })],
                )
            }
            _ => ("user", user_parts(&message.content)?),
        };

        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let mut config = serde_json::Map::new();
    if let Some(t) = request.temperature {
        config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        config.insert("topP".into(), json!(p));
    }
    if let Some(m) = request.max_tokens {
        config.insert("maxOutputTokens".into(), json!(m));
    }
    let stop = request.stop_sequences();
    if !stop.is_empty() {
        config.insert("stopSequences".into(), json!(stop));
    }

    let tools = match &request.tools {
        Some(Value::Array(tools)) if !tools.is_empty() => {
            let declarations: Vec<Value> = tools
                .iter()
                .filter_map(|t| t.get("function"))
                .map(|f| {
                    let mut decl = json!({
                        "name": f["name"],
                        "description": f.get("description").cloned().unwrap_or(json!("")),
                    });
                    if let Some(params) = f.get("parameters") {
                        decl["parameters"] = params.clone();
                    }
                    decl
                })
                .collect();
            Some(json!([{"functionDeclarations": declarations}]))
        }
        _ => None,
    };

    Ok(GeminiChatRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system,
        }),
        generation_config: (!config.is_empty()).then(|| Value::Object(config)),
        tools,
    })
}

fn assistant_parts(message: &Message, call_names: &mut HashMap<String, String>) -> Vec<Value> {
    let mut parts = Vec::new();
    let text = message.content_text();
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    if let Some(Value::Array(calls)) = &message.tool_calls {
        for call in calls {
            let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
            if let Some(id) = call["id"].as_str() {
                call_names.insert(id.to_string(), name.clone());
            }
            let args = call["function"]["arguments"]
                .as_str()
                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                .unwrap_or_else(|| json!({}));
            parts.push(json!({"functionCall": {"name": name, "args": args}}));
        }
    }
    parts
}

fn user_parts(content: &Value) -> Result<Vec<Value>, RelayError> {
    let parts = match content {
        Value::String(text) => return Ok(vec![json!({"text": text})]),
        Value::Array(parts) => parts,
        Value::Null => return Ok(Vec::new()),
        _ => return Err(RelayError::bad_request("message content must be a string or an array")),
    };
    let mut converted = Vec::with_capacity(parts.len());
    for part in parts {
        match part["type"].as_str() {
            Some("text") => converted.push(json!({"text": part["text"]})),
            Some("image_url") => {
                let url = part["image_url"]["url"].as_str().unwrap_or_default();
                let Some((mime, data)) = url
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split_once(";base64,"))
                else {
                    return Err(RelayError::NotImplemented(
                        "gemini channels only accept inline base64 images".to_string(),
                    ));
                };
                converted.push(json!({"inlineData": {"mimeType": mime, "data": data}}));
            }
            other => {
                return Err(RelayError::NotImplemented(format!(
                    "content part type {:?} cannot be sent to gemini",
                    other
                )))
            }
        }
    }
    Ok(converted)
}

fn embedding_to_gemini(request: &EmbeddingRequest) -> Value {
    let model = format!("models/{}", request.model);
    let requests: Vec<Value> = request
        .parse_input()
        .into_iter()
        .map(|text| {
            let mut item = json!({
                "model": model,
                "content": {"parts": [{"text": text}]}
            });
            if let Some(dimensions) = request.dimensions {
                item["outputDimensionality"] = json!(dimensions);
            }
            item
        })
        .collect();
    json!({"requests": requests})
}

fn api_version(info: &RelayInfo) -> &str {
    info.api_version
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_API_VERSION)
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let action = match info.relay_mode {
            RelayMode::ChatCompletions if info.is_stream => "streamGenerateContent?alt=sse",
            RelayMode::ChatCompletions => "generateContent",
            RelayMode::Embeddings => "batchEmbedContents",
            mode => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by gemini channels",
                    mode
                )))
            }
        };
        Ok(format!(
            "{}/{}/models/{}:{}",
            info.base_url,
            api_version(info),
            info.upstream_model,
            action
        ))
    }

    async fn build_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        set_header(headers, HeaderName::from_static("x-goog-api-key"), &info.api_key)
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request {
            RelayRequest::Chat(chat) => serde_json::to_value(chat_to_gemini(chat)?)
                .map_err(|e| RelayError::bad_request(format!("marshal request body failed: {}", e)))?,
            RelayRequest::Embedding(embedding) => embedding_to_gemini(embedding),
            _ => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by gemini channels",
                    info.relay_mode
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
            RelayMode::Embeddings => {
                let body = helper::read_body(response).await?;
                let parsed: Value = helper::parse_json(&body)?;
                let data: Vec<EmbeddingData> = parsed["embeddings"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .enumerate()
                            .map(|(index, item)| EmbeddingData {
                                object: "embedding".to_string(),
                                index,
                                embedding: serde_json::from_value(item["values"].clone())
                                    .unwrap_or_default(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if data.is_empty() && info.check_empty_response {
                    return Err(RelayError::EmptyResponse);
                }
                let response = EmbeddingResponse {
                    object: "list".to_string(),
                    data,
                    model: info.origin_model.clone(),
                    usage: Usage::default(),
                };
                Ok(RelayOutcome::new(
                    Json(response).into_response(),
                    None,
                ))
            }
            _ if info.is_stream => {
                let frames = gemini_frames(
                    response,
                    format!("chatcmpl-{}", info.request_id),
                    info.origin_model.clone(),
                );
                stream::respond_stream(info, frames).await
            }
            _ => {
                let body = helper::read_body(response).await?;
                let parsed: GeminiChatResponse = helper::parse_json(&body)?;
                let (text, calls, finish) = parsed.first_output();
                let mut converted = ChatCompletionResponse::single(
                    format!("chatcmpl-{}", info.request_id),
                    info.origin_model.clone(),
                    text,
                    finish,
                    parsed.usage(),
                );
                if !calls.is_empty() {
                    if let Some(choice) = converted.choices.first_mut() {
                        choice.message.tool_calls = Some(Value::Array(calls));
                    }
                }
                helper::chat_response(info, converted)
            }
        }
    }

    fn supported_models(&self) -> Vec<String> {
        model_list(MODELS)
    }

    fn channel_name(&self) -> &'static str {
        "gemini"
    }
}

fn gemini_frames(response: reqwest::Response, id: String, model: String) -> FrameStream {
    let mut lines = stream::lines(response);
    Box::pin(async_stream::try_stream! {
        while let Some(line) = lines.next().await {
            let line = line?;
            let Some(data) = stream::sse_data(&line) else {
                continue;
            };
            let parsed: GeminiChatResponse = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("解析Gemini流分片失败: {}, 内容: {}", e, data);
                    continue;
                }
            };
            let (text, calls, finish) = parsed.first_output();
            let mut chunk = ChatCompletionChunk::new(id.clone(), model.clone());
            if !text.is_empty() || !calls.is_empty() {
                chunk.choices.push(StreamChoice {
                    index: 0,
                    delta: Delta {
                        content: (!text.is_empty()).then_some(text),
                        tool_calls: (!calls.is_empty()).then(|| {
                            Value::Array(
                                calls
                                    .into_iter()
                                    .enumerate()
                                    .map(|(i, mut c)| {
                                        c["index"] = json!(i);
                                        c
                                    })
                                    .collect(),
                            )
                        }),
                        ..Default::default()
                    },
                    finish_reason: None,
                });
            }
            if let Some(finish) = finish {
                chunk = chunk.with_finish(finish);
            }
            chunk.usage = parsed.usage();
            yield StreamFrame::Chunk(chunk);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{test_channel, ChannelType};
    use crate::relay::relay_info::test_info;
    use crate::relay::RelayFormat;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bound(mode: RelayMode, base_url: &str) -> RelayInfo {
        let mut channel = test_channel(2);
        channel.channel_type = ChannelType::Gemini;
        channel.base_url = Some(base_url.to_string());
        test_info(mode, RelayFormat::OpenAI).bind_channel(&channel, "gemini-2.0-flash")
    }

    #[test]
    fn urls_depend_on_mode_and_stream() {
        let adaptor = GeminiAdaptor::new(Client::new());
        let mut info = bound(RelayMode::ChatCompletions, "https://generativelanguage.googleapis.com");
        assert_eq!(
            adaptor.build_upstream_url(&info).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        info.is_stream = true;
        assert!(adaptor
            .build_upstream_url(&info)
            .unwrap()
            .ends_with(":streamGenerateContent?alt=sse"));

        let info = bound(RelayMode::ImagesGenerations, "https://x");
        assert!(matches!(
            adaptor.build_upstream_url(&info),
            Err(RelayError::NotImplemented(_))
        ));
    }

    #[test]
    fn chat_request_maps_roles_and_tools() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.0-flash",
            "max_tokens": 64,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}}}]
        }))
        .unwrap();

        let converted = chat_to_gemini(&request).unwrap();
        assert_eq!(converted.system_instruction.unwrap().parts, vec![json!({"text": "be brief"})]);
        assert_eq!(converted.contents.len(), 3);
        assert_eq!(converted.contents[1].role.as_deref(), Some("model"));
        assert_eq!(
            converted.contents[1].parts[0]["functionCall"]["args"],
            json!({"city": "Paris"})
        );
        assert_eq!(
            converted.contents[2].parts[0]["functionResponse"]["name"],
            json!("get_weather")
        );
        assert_eq!(converted.generation_config.unwrap()["maxOutputTokens"], json!(64));
        assert_eq!(
            converted.tools.unwrap()[0]["functionDeclarations"][0]["name"],
            json!("get_weather")
        );
    }

    #[test]
    fn remote_images_are_not_implemented() {
        let content = json!([{"type": "image_url", "image_url": {"url": "https://x/cat.png"}}]);
        assert!(matches!(user_parts(&content), Err(RelayError::NotImplemented(_))));
        let content = json!([{"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}]);
        assert_eq!(
            user_parts(&content).unwrap(),
            vec![json!({"inlineData": {"mimeType": "image/png", "data": "AAAA"}})]
        );
    }

    #[tokio::test]
    async fn response_is_converted_to_openai() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Bonjour"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
            })))
            .mount(&server)
            .await;

        let mut info = bound(RelayMode::ChatCompletions, &server.uri());
        let adaptor = GeminiAdaptor::new(Client::new());
        let response = Client::new()
            .post(adaptor.build_upstream_url(&info).unwrap())
            .send()
            .await
            .unwrap();
        let outcome = adaptor.parse_response(&mut info, response).await.unwrap();
        assert_eq!(outcome.usage, Some(Usage::new(4, 2)));
        let bytes = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], json!("Bonjour"));
        assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(body["model"], json!("gpt-4"));
    }

    #[test]
    fn finish_reasons_are_mapped() {
        assert_eq!(finish_reason("STOP", false), "stop");
        assert_eq!(finish_reason("STOP", true), "tool_calls");
        assert_eq!(finish_reason("MAX_TOKENS", false), "length");
        assert_eq!(finish_reason("SAFETY", false), "content_filter");
    }
}
