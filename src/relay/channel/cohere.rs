use async_trait::async_trait;
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::dto::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, RerankRequest,
    RerankResponse, RerankResult, Usage,
};
use crate::error::RelayError;
use crate::relay::channel::{ensure_text_chat, set_bearer};
use crate::relay::stream::{self, FrameStream, StreamFrame};
use crate::relay::{
    helper, model_list, Adaptor, RelayInfo, RelayMode, RelayOutcome, RelayRequest, UpstreamBody,
};

const MODELS: &[&str] = &[
    "command-a-03-2025",
    "command-r",
    "command-r-plus",
    "command-r-08-2024",
    "command-r-plus-08-2024",
    "command-light",
    "command",
    "rerank-english-v3.0",
    "rerank-multilingual-v3.0",
    "rerank-english-v2.0",
    "rerank-multilingual-v2.0",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatHistory {
    pub role: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CohereChatRequest {
    pub model: String,
    pub chat_history: Vec<ChatHistory>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BilledUnits {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    billed_units: BilledUnits,
}

impl Meta {
    fn usage(&self) -> Usage {
        Usage::new(self.billed_units.input_tokens, self.billed_units.output_tokens)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CohereChatResponse {
    #[serde(default)]
    response_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    meta: Meta,
}

/// JSON lines 流中的一条事件
#[derive(Debug, Clone, Default, Deserialize)]
struct CohereStreamEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    response: Option<CohereChatResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CohereRerankResponse {
    #[serde(default)]
    results: Vec<RerankResult>,
    #[serde(default)]
    meta: Meta,
}

fn finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "ERROR_TOXIC" => "content_filter",
        _ => "stop",
    }
}

/// 最后一条用户消息作为 message，其余进入 chat_history
pub fn chat_to_cohere(request: &ChatCompletionRequest) -> Result<CohereChatRequest, RelayError> {
    ensure_text_chat(request, "cohere")?;
    let mut preamble = Vec::new();
    let mut history = Vec::new();
    for message in &request.messages {
        let role = match message.role.as_str() {
            "system" | "developer" => {
                preamble.push(message.content_text());
                continue;
            }
            "assistant" => "CHATBOT",
            _ => "USER",
        };
        history.push(ChatHistory {
            role: role.to_string(),
            message: message.content_text(),
        });
    }
    let message = match history.pop() {
        Some(last) if last.role == "USER" => last.message,
        _ => {
            return Err(RelayError::NotImplemented(
                "cohere channels require the last message to come from the user".to_string(),
            ))
        }
    };
    let stop = request.stop_sequences();
    Ok(CohereChatRequest {
        model: request.model.clone(),
        chat_history: history,
        message,
        preamble: (!preamble.is_empty()).then(|| preamble.join("\n")),
        stream: request.is_stream(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: (!stop.is_empty()).then_some(stop),
    })
}

fn rerank_to_cohere(request: &RerankRequest) -> Value {
    serde_json::json!({
        "model": request.model,
        "query": request.query,
        "documents": request.documents,
        "top_n": request.top_n.unwrap_or(request.documents.len() as u32),
        "return_documents": request.return_documents.unwrap_or(false),
    })
}

pub struct CohereAdaptor {
    client: Client,
}

impl CohereAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Adaptor for CohereAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        match info.relay_mode {
            RelayMode::ChatCompletions => Ok(format!("{}/v1/chat", info.base_url)),
            RelayMode::Rerank => Ok(format!("{}/v1/rerank", info.base_url)),
            mode => Err(RelayError::NotImplemented(format!(
                "{:?} is not supported by cohere channels",
                mode
            ))),
        }
    }

    async fn build_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        set_bearer(headers, &info.api_key)
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request {
            RelayRequest::Chat(chat) => serde_json::to_value(chat_to_cohere(chat)?)
                .map_err(|e| RelayError::bad_request(format!("marshal request body failed: {}", e)))?,
            RelayRequest::Rerank(rerank) => rerank_to_cohere(rerank),
            _ => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by cohere channels",
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
        if info.relay_mode == RelayMode::Rerank {
            let body = helper::read_body(response).await?;
            let parsed: CohereRerankResponse = helper::parse_json(&body)?;
            if parsed.results.is_empty() && info.check_empty_response {
                return Err(RelayError::EmptyResponse);
            }
            let usage = parsed.meta.usage();
            let response = RerankResponse {
                results: parsed.results,
                usage,
            };
            return Ok(RelayOutcome::new(
                Json(response).into_response(),
                Some(usage),
            ));
        }

        if info.is_stream {
            let frames = cohere_frames(
                response,
                format!("chatcmpl-{}", info.request_id),
                info.origin_model.clone(),
            );
            return stream::respond_stream(info, frames).await;
        }

        let body = helper::read_body(response).await?;
        let parsed: CohereChatResponse = helper::parse_json(&body)?;
        let converted = ChatCompletionResponse::single(
            parsed.response_id,
            info.origin_model.clone(),
            parsed.text,
            parsed
                .finish_reason
                .as_deref()
                .map(|r| finish_reason(r).to_string()),
            Some(parsed.meta.usage()),
        );
        helper::chat_response(info, converted)
    }

    fn supported_models(&self) -> Vec<String> {
        model_list(MODELS)
    }

    fn channel_name(&self) -> &'static str {
        "cohere"
    }
}

/// Cohere 的流是逐行JSON，不是SSE
fn cohere_frames(response: reqwest::Response, id: String, model: String) -> FrameStream {
    let mut lines = stream::lines(response);
    Box::pin(async_stream::try_stream! {
        while let Some(line) = lines.next().await {
            let line = line?;
            let event: CohereStreamEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    error!("解析Cohere流事件失败: {}, 内容: {}", e, line);
                    continue;
                }
            };
            match event.event_type.as_str() {
                "text-generation" => {
                    yield StreamFrame::Chunk(
                        ChatCompletionChunk::new(id.clone(), model.clone()).with_text(event.text),
                    );
                }
                "stream-end" => {
                    let reason = event
                        .finish_reason
                        .as_deref()
                        .or_else(|| event.response.as_ref().and_then(|r| r.finish_reason.as_deref()))
                        .map(finish_reason)
                        .unwrap_or("stop");
                    let mut chunk = ChatCompletionChunk::new(id.clone(), model.clone()).with_finish(reason);
                    chunk.usage = event.response.as_ref().map(|r| r.meta.usage());
                    yield StreamFrame::Chunk(chunk);
                    break;
                }
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::Message;
    use crate::models::channel::{test_channel, ChannelType};
    use crate::relay::relay_info::test_info;
    use crate::relay::RelayFormat;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bound(mode: RelayMode, base_url: &str) -> RelayInfo {
        let mut channel = test_channel(5);
        channel.channel_type = ChannelType::Cohere;
        channel.base_url = Some(base_url.to_string());
        test_info(mode, RelayFormat::OpenAI).bind_channel(&channel, "command-r")
    }

    #[test]
    fn last_user_message_becomes_message() {
        let request = ChatCompletionRequest {
            model: "command-r".into(),
            messages: vec![
                Message::text("system", "be brief"),
                Message::text("user", "hi"),
                Message::text("assistant", "hello"),
                Message::text("user", "how are you"),
            ],
            ..Default::default()
        };
        let converted = chat_to_cohere(&request).unwrap();
        assert_eq!(converted.message, "how are you");
        assert_eq!(converted.preamble.as_deref(), Some("be brief"));
        assert_eq!(
            converted.chat_history.iter().map(|h| h.role.as_str()).collect::<Vec<_>>(),
            vec!["USER", "CHATBOT"]
        );
    }

    #[test]
    fn trailing_assistant_message_is_rejected() {
        let request = ChatCompletionRequest {
            model: "command-r".into(),
            messages: vec![Message::text("user", "hi"), Message::text("assistant", "hello")],
            ..Default::default()
        };
        assert!(matches!(chat_to_cohere(&request), Err(RelayError::NotImplemented(_))));
    }

    #[test]
    fn tools_and_images_are_not_implemented() {
        let mut user = Message::text("user", "");
        user.content = json!([
            {"type": "text", "text": "what is in this picture?"},
            {"type": "image_url", "image_url": {"url": "https://x/cat.png"}}
        ]);
        let request = ChatCompletionRequest {
            model: "command-r".into(),
            messages: vec![user],
            ..Default::default()
        };
        assert!(matches!(chat_to_cohere(&request), Err(RelayError::NotImplemented(_))));

        let request = ChatCompletionRequest {
            model: "command-r".into(),
            messages: vec![Message::text("user", "weather?")],
            tools: Some(json!([{"type": "function", "function": {"name": "weather"}}])),
            ..Default::default()
        };
        let info = bound(RelayMode::ChatCompletions, "https://api.cohere.ai");
        assert!(matches!(
            CohereAdaptor::new(Client::new()).convert_request(&info, &RelayRequest::Chat(request)),
            Err(RelayError::NotImplemented(_))
        ));
    }

    async fn call(server: &MockServer, mut info: RelayInfo) -> Result<RelayOutcome, RelayError> {
        let adaptor = CohereAdaptor::new(Client::new());
        let response = Client::new()
            .post(adaptor.build_upstream_url(&info).unwrap())
            .send()
            .await
            .unwrap();
        assert!(server.received_requests().await.is_some());
        adaptor.parse_response(&mut info, response).await
    }

    async fn body_text(outcome: RelayOutcome) -> String {
        let bytes = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_lines_stream_is_converted() {
        let server = MockServer::start().await;
        let lines = concat!(
            "{\"is_finished\":false,\"event_type\":\"stream-start\"}\n",
            "{\"is_finished\":false,\"event_type\":\"text-generation\",\"text\":\"Hel\"}\n",
            "{\"is_finished\":false,\"event_type\":\"text-generation\",\"text\":\"lo\"}\n",
            "{\"is_finished\":true,\"event_type\":\"stream-end\",\"finish_reason\":\"COMPLETE\",",
            "\"response\":{\"response_id\":\"r1\",\"text\":\"Hello\",\"meta\":{\"billed_units\":{\"input_tokens\":3,\"output_tokens\":2}}}}\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(lines, "application/stream+json"))
            .mount(&server)
            .await;

        let mut info = bound(RelayMode::ChatCompletions, &server.uri());
        info.is_stream = true;
        let body = body_text(call(&server, info).await.unwrap()).await;
        assert!(body.contains("\"content\":\"Hel\""));
        assert!(body.contains("\"finish_reason\":\"stop\""));
        assert!(body.contains("\"completion_tokens\":2"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn rerank_results_are_returned_with_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "x",
                "results": [{"index": 1, "relevance_score": 0.9}, {"index": 0, "relevance_score": 0.1}],
                "meta": {"billed_units": {"search_units": 1}}
            })))
            .mount(&server)
            .await;

        let info = bound(RelayMode::Rerank, &server.uri());
        let outcome = call(&server, info).await.unwrap();
        let body: Value = serde_json::from_str(&body_text(outcome).await).unwrap();
        assert_eq!(body["results"][0]["index"], json!(1));
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn embeddings_are_not_implemented() {
        let info = bound(RelayMode::Embeddings, "https://api.cohere.ai");
        assert!(matches!(
            CohereAdaptor::new(Client::new()).build_upstream_url(&info),
            Err(RelayError::NotImplemented(_))
        ));
    }
}
