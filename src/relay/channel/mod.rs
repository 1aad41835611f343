//! 各上游渠道的适配器实现

pub mod baidu;
pub mod claude;
pub mod cohere;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod zhipu;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::dto::ChatCompletionRequest;
use crate::error::RelayError;

/// 写入一个请求头，非法值按本地错误处理
pub(crate) fn set_header(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: &str,
) -> Result<(), RelayError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| RelayError::bad_request(format!("invalid value for header {}", name)))?;
    headers.insert(name, value);
    Ok(())
}

pub(crate) fn set_bearer(headers: &mut HeaderMap, token: &str) -> Result<(), RelayError> {
    set_header(headers, AUTHORIZATION, &format!("Bearer {}", token))
}

/// 只支持纯文本对话的渠道：工具调用与非文本片段无法转换
pub(crate) fn ensure_text_chat(
    request: &ChatCompletionRequest,
    channel: &str,
) -> Result<(), RelayError> {
    if request.tools.is_some() || request.tool_choice.is_some() {
        return Err(RelayError::NotImplemented(format!(
            "tools are not supported by {} channels",
            channel
        )));
    }
    for message in &request.messages {
        if message.role == "tool" || message.tool_calls.is_some() || message.tool_call_id.is_some() {
            return Err(RelayError::NotImplemented(format!(
                "tool messages are not supported by {} channels",
                channel
            )));
        }
        if let Value::Array(parts) = &message.content {
            if let Some(part) = parts
                .iter()
                .find(|p| p.get("type").and_then(Value::as_str) != Some("text"))
            {
                return Err(RelayError::NotImplemented(format!(
                    "content part type {} cannot be sent to {} channels",
                    part.get("type").unwrap_or(&Value::Null),
                    channel
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::Message;
    use serde_json::json;

    fn request(messages: Vec<Message>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "m".into(),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn text_only_chat_passes() {
        let mut user = Message::text("user", "");
        user.content = json!([{"type": "text", "text": "hi"}]);
        let chat = request(vec![Message::text("system", "be brief"), user]);
        assert!(ensure_text_chat(&chat, "baidu").is_ok());
    }

    #[test]
    fn tools_tool_messages_and_images_are_rejected() {
        let mut chat = request(vec![Message::text("user", "hi")]);
        chat.tools = Some(json!([{"type": "function", "function": {"name": "f"}}]));
        assert!(matches!(ensure_text_chat(&chat, "baidu"), Err(RelayError::NotImplemented(_))));

        let mut chat = request(vec![Message::text("user", "hi")]);
        chat.tool_choice = Some(json!("auto"));
        assert!(matches!(ensure_text_chat(&chat, "baidu"), Err(RelayError::NotImplemented(_))));

        let chat = request(vec![Message::text("user", "hi"), Message::text("tool", "42")]);
        assert!(matches!(ensure_text_chat(&chat, "baidu"), Err(RelayError::NotImplemented(_))));

        let mut user = Message::text("user", "");
        user.content = json!([
            {"type": "text", "text": "what is in this picture?"},
            {"type": "image_url", "image_url": {"url": "https://x/cat.png"}}
        ]);
        let chat = request(vec![user]);
        assert!(matches!(ensure_text_chat(&chat, "cohere"), Err(RelayError::NotImplemented(_))));
    }
}
