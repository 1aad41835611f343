use serde_json::{json, Map, Value};
use tracing::debug;

use crate::dto::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, ClaudeMessage, ClaudeRequest,
    ClaudeResponse, ClaudeUsage, Message, Usage,
};
use crate::error::RelayError;

/// Claude 要求必须提供 max_tokens
pub const DEFAULT_CLAUDE_MAX_TOKENS: u32 = 4096;

pub fn openai_stop_to_claude(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        _ => "end_turn",
    }
}

pub fn claude_stop_to_openai(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Claude 请求转规范请求（发往非Claude渠道时使用）
pub fn claude_request_to_openai(request: &ClaudeRequest) -> Result<ChatCompletionRequest, RelayError> {
    if request.has_tools() {
        return Err(RelayError::NotImplemented(
            "tool use in claude format is only supported by claude channels".to_string(),
        ));
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system_text() {
        messages.push(Message::text("system", system));
    }
    for message in &request.messages {
        messages.push(Message {
            role: message.role.clone(),
            content: claude_content_to_openai(&message.content)?,
            ..Default::default()
        });
    }

    if request.top_k.is_some() {
        debug!("top_k 无法转换为OpenAI格式, 已忽略");
    }

    let is_stream = request.is_stream();
    Ok(ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        max_tokens: (request.max_tokens > 0).then_some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request
            .stop_sequences
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| json!(s)),
        stream_options: is_stream.then(|| json!({"include_usage": true})),
        ..Default::default()
    })
}

fn claude_content_to_openai(content: &Value) -> Result<Value, RelayError> {
    let blocks = match content {
        Value::String(_) => return Ok(content.clone()),
        Value::Array(blocks) => blocks,
        _ => return Err(RelayError::bad_request("message content must be a string or an array")),
    };

    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => parts.push(json!({
                "type": "text",
                "text": block.get("text").and_then(Value::as_str).unwrap_or_default(),
            })),
            Some("image") => {
                let source = block.get("source").cloned().unwrap_or(Value::Null);
                let url = match source.get("type").and_then(Value::as_str) {
                    Some("base64") => format!(
                        "data:{};base64,{}",
                        source.get("media_type").and_then(Value::as_str).unwrap_or("image/png"),
                        source.get("data").and_then(Value::as_str).unwrap_or_default()
                    ),
                    Some("url") => source
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    _ => return Err(RelayError::bad_request("unsupported image source")),
                };
                parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            Some(other) => {
                return Err(RelayError::NotImplemented(format!(
                    "content block type '{}' is only supported by claude channels",
                    other
                )))
            }
            None => return Err(RelayError::bad_request("content block without type")),
        }
    }

    // 纯文本时合并为字符串，兼容只接受字符串内容的上游
    if parts.iter().all(|p| p["type"] == "text") {
        let text = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(Value::String(text));
    }
    Ok(Value::Array(parts))
}

/// 规范请求转 Claude 请求
pub fn openai_request_to_claude(request: &ChatCompletionRequest) -> Result<ClaudeRequest, RelayError> {
    let mut system = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = match message.role.as_str() {
            "system" | "developer" => {
                system.push(message.content_text());
                continue;
            }
            "tool" => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content_text(),
                })],
            ),
            "assistant" => ("assistant", assistant_blocks(message)?),
            _ => ("user", openai_content_to_claude(&message.content)?),
        };

        // Claude 要求角色交替出现，相邻同角色消息合并
        match messages.last_mut() {
            Some(last) if last.role == role => {
                if let Value::Array(existing) = &mut last.content {
                    existing.extend(blocks);
                }
            }
            _ => messages.push(ClaudeMessage {
                role: role.to_string(),
                content: Value::Array(blocks),
            }),
        }
    }

    let tools = match &request.tools {
        Some(Value::Array(tools)) if !tools.is_empty() => Some(Value::Array(
            tools
                .iter()
                .filter_map(|t| t.get("function"))
                .map(|f| {
                    json!({
                        "name": f.get("name").cloned().unwrap_or(Value::Null),
                        "description": f.get("description").cloned().unwrap_or(json!("")),
                        "input_schema": f
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect(),
        )),
        _ => None,
    };

    let tool_choice = match &request.tool_choice {
        Some(Value::String(choice)) if choice == "required" => Some(json!({"type": "any"})),
        Some(Value::String(choice)) if choice == "auto" => Some(json!({"type": "auto"})),
        Some(Value::Object(choice)) => choice
            .get("function")
            .and_then(|f| f.get("name"))
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    };

    let tools_disabled = matches!(&request.tool_choice, Some(Value::String(c)) if c == "none");
    let stop = request.stop_sequences();
    Ok(ClaudeRequest {
        model: request.model.clone(),
        messages,
        system: (!system.is_empty()).then(|| Value::String(system.join("\n"))),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_CLAUDE_MAX_TOKENS),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: (!stop.is_empty()).then_some(stop),
        tools: tools.filter(|_| !tools_disabled),
        tool_choice,
        extra: Map::new(),
    })
}

fn assistant_blocks(message: &Message) -> Result<Vec<Value>, RelayError> {
    let mut blocks = Vec::new();
    let text = message.content_text();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    if let Some(Value::Array(calls)) = &message.tool_calls {
        for call in calls {
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments)
                .map_err(|e| RelayError::bad_request(format!("invalid tool call arguments: {}", e)))?;
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "input": input,
            }));
        }
    }
    Ok(blocks)
}

fn openai_content_to_claude(content: &Value) -> Result<Vec<Value>, RelayError> {
    let parts = match content {
        Value::String(text) => return Ok(vec![json!({"type": "text", "text": text})]),
        Value::Array(parts) => parts,
        Value::Null => return Ok(Vec::new()),
        _ => return Err(RelayError::bad_request("message content must be a string or an array")),
    };

    let mut blocks = Vec::with_capacity(parts.len());
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => blocks.push(json!({
                "type": "text",
                "text": part.get("text").and_then(Value::as_str).unwrap_or_default(),
            })),
            Some("image_url") => {
                let url = part
                    .get("image_url")
                    .and_then(|i| i.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                blocks.push(image_block(url));
            }
            Some(other) => {
                return Err(RelayError::NotImplemented(format!(
                    "content part type '{}' cannot be sent to claude",
                    other
                )))
            }
            None => return Err(RelayError::bad_request("content part without type")),
        }
    }
    Ok(blocks)
}

fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            });
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

/// Claude 响应转规范响应
pub fn claude_response_to_openai(response: &ClaudeResponse) -> ChatCompletionResponse {
    let tool_calls: Vec<Value> = response
        .content
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .map(|b| {
            json!({
                "id": b.get("id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": b.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": b.get("input").map(Value::to_string).unwrap_or_else(|| "{}".into()),
                }
            })
        })
        .collect();

    let usage = response
        .usage
        .as_ref()
        .map(|u| Usage::new(u.input_tokens, u.output_tokens));
    let mut converted = ChatCompletionResponse::single(
        response.id.clone(),
        response.model.clone(),
        response.text(),
        response
            .stop_reason
            .as_deref()
            .map(|r| claude_stop_to_openai(r).to_string()),
        usage,
    );
    if !tool_calls.is_empty() {
        if let Some(choice) = converted.choices.first_mut() {
            choice.message.tool_calls = Some(Value::Array(tool_calls));
        }
    }
    converted
}

/// 规范响应转 Claude 响应（Claude格式的客户端）
pub fn openai_response_to_claude(response: &ChatCompletionResponse, model: &str) -> ClaudeResponse {
    let first: Option<&Choice> = response.choices.first();
    let mut content = Vec::new();
    if let Some(choice) = first {
        let text = choice.message.content_text();
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }

    let usage = response.usage.unwrap_or_default();
    ClaudeResponse {
        id: if response.id.is_empty() {
            "msg_relay".to_string()
        } else {
            response.id.clone()
        },
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: Some(
            first
                .and_then(|c| c.finish_reason.as_deref())
                .map(openai_stop_to_claude)
                .unwrap_or("end_turn")
                .to_string(),
        ),
        stop_sequence: None,
        usage: Some(ClaudeUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn claude_request(raw: Value) -> ClaudeRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn claude_request_with_tools_is_not_implemented_for_other_channels() {
        let request = claude_request(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
        }));
        assert!(matches!(
            claude_request_to_openai(&request),
            Err(RelayError::NotImplemented(_))
        ));
    }

    #[test]
    fn claude_request_maps_system_and_images() {
        let request = claude_request(json!({
            "model": "m",
            "max_tokens": 64,
            "system": [{"type": "text", "text": "be brief"}],
            "stop_sequences": ["END"],
            "stream": true,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "AAAA"}}
                ]}
            ]
        }));
        let converted = claude_request_to_openai(&request).unwrap();
        assert_eq!(converted.messages[0], Message::text("system", "be brief"));
        assert_eq!(
            converted.messages[1].content[1]["image_url"]["url"],
            json!("data:image/jpeg;base64,AAAA")
        );
        assert_eq!(converted.max_tokens, Some(64));
        assert_eq!(converted.stop, Some(json!(["END"])));
        assert_eq!(converted.stream_options, Some(json!({"include_usage": true})));
    }

    #[test]
    fn openai_request_merges_roles_and_tools() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-3-haiku",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{\"a\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "42"},
                {"role": "user", "content": "thanks"}
            ],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {"type": "object"}}}]
        }))
        .unwrap();

        let converted = openai_request_to_claude(&request).unwrap();
        assert_eq!(converted.system, Some(json!("sys")));
        assert_eq!(converted.max_tokens, DEFAULT_CLAUDE_MAX_TOKENS);
        assert_eq!(converted.messages.len(), 3);
        assert_eq!(converted.messages[1].content[0]["type"], json!("tool_use"));
        assert_eq!(converted.messages[1].content[0]["input"], json!({"a": 1}));
        // tool_result 与随后的 user 消息合并
        assert_eq!(converted.messages[2].content.as_array().unwrap().len(), 2);
        assert_eq!(converted.tools.unwrap()[0]["name"], json!("f"));
    }

    #[test]
    fn claude_response_round_trips_tool_use() {
        let response: ClaudeResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude",
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "tu_1", "name": "f", "input": {"x": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();

        let converted = claude_response_to_openai(&response);
        let choice = &converted.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(choice.message.content_text(), "calling");
        assert_eq!(
            choice.message.tool_calls.as_ref().unwrap()[0]["function"]["arguments"],
            json!("{\"x\":1}")
        );
        assert_eq!(converted.usage, Some(Usage::new(10, 5)));
    }

    #[test]
    fn openai_response_becomes_claude_message() {
        let response = ChatCompletionResponse::single(
            "chatcmpl-1",
            "gpt-4",
            "hello",
            Some("length".into()),
            Some(Usage::new(3, 4)),
        );
        let converted = openai_response_to_claude(&response, "gpt-4-virtual");
        assert_eq!(converted.model, "gpt-4-virtual");
        assert_eq!(converted.text(), "hello");
        assert_eq!(converted.stop_reason.as_deref(), Some("max_tokens"));
        assert_eq!(converted.usage.unwrap().output_tokens, 4);
    }
}
