use async_trait::async_trait;
use axum::response::IntoResponse;
use axum::Json;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::dto::{EmbeddingData, EmbeddingResponse, Usage};
use crate::error::{ApiError, RelayError};
use crate::relay::channel::set_bearer;
use crate::relay::stream;
use crate::relay::{
    helper, Adaptor, RelayFormat, RelayInfo, RelayMode, RelayOutcome, RelayRequest, UpstreamBody,
};

#[derive(Debug, Default, Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    prompt_eval_count: u32,
}

/// 本地 Ollama：聊天走 OpenAI 兼容接口，向量走原生 `/api/embed`
pub struct OllamaAdaptor {
    client: Client,
}

impl OllamaAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Adaptor for OllamaAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        match info.relay_mode {
            RelayMode::Embeddings => Ok(format!("{}/api/embed", info.base_url)),
            RelayMode::ChatCompletions | RelayMode::Completions => Ok(format!(
                "{}{}",
                info.base_url,
                info.relay_mode.openai_path()
            )),
            mode => Err(RelayError::NotImplemented(format!(
                "{:?} is not supported by ollama channels",
                mode
            ))),
        }
    }

    async fn build_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        if info.api_key.is_empty() {
            return Ok(());
        }
        set_bearer(headers, &info.api_key)
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request {
            RelayRequest::Chat(chat) => serde_json::to_value(chat),
            RelayRequest::Completion(completion) => serde_json::to_value(completion),
            RelayRequest::Embedding(embedding) => Ok(json!({
                "model": embedding.model,
                "input": embedding.parse_input(),
            })),
            _ => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by ollama channels",
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

    async fn parse_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
    ) -> Result<RelayOutcome, RelayError> {
        match info.relay_mode {
            RelayMode::Embeddings => {
                let body = helper::read_body(response).await?;
                let parsed: OllamaEmbeddingResponse = helper::parse_json(&body)?;
                if !parsed.error.is_empty() {
                    return Err(RelayError::upstream(
                        500,
                        ApiError::new(parsed.error, "ollama_error").with_code("500"),
                    ));
                }
                if parsed.embeddings.is_empty() && info.check_empty_response {
                    return Err(RelayError::EmptyResponse);
                }
                let usage = Usage::new(parsed.prompt_eval_count, 0);
                let response = EmbeddingResponse {
                    object: "list".to_string(),
                    data: parsed
                        .embeddings
                        .into_iter()
                        .enumerate()
                        .map(|(index, embedding)| EmbeddingData {
                            object: "embedding".to_string(),
                            index,
                            embedding,
                        })
                        .collect(),
                    model: info.origin_model.clone(),
                    usage,
                };
                Ok(RelayOutcome::new(
                    Json(response).into_response(),
                    Some(usage),
                ))
            }
            RelayMode::ChatCompletions if info.is_stream => {
                let passthrough = info.relay_format == RelayFormat::OpenAI;
                stream::respond_stream(info, stream::openai_frames(response, passthrough)).await
            }
            RelayMode::ChatCompletions => helper::openai_chat_response(info, response).await,
            _ => helper::passthrough_response(info, response).await,
        }
    }

    /// 模型取决于本地拉取的内容
    fn supported_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn channel_name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::EmbeddingRequest;
    use crate::models::channel::{test_channel, ChannelType};
    use crate::relay::relay_info::test_info;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bound(mode: RelayMode, base_url: &str) -> RelayInfo {
        let mut channel = test_channel(6);
        channel.channel_type = ChannelType::Ollama;
        channel.base_url = Some(base_url.to_string());
        channel.key = String::new();
        test_info(mode, RelayFormat::OpenAI).bind_channel(&channel, "nomic-embed-text")
    }

    #[tokio::test]
    async fn embeddings_use_native_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_json(json!({"model": "nomic-embed-text", "input": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "nomic-embed-text",
                "embeddings": [[0.1, 0.2], [0.3, 0.4]],
                "prompt_eval_count": 4
            })))
            .mount(&server)
            .await;

        let mut info = bound(RelayMode::Embeddings, &server.uri());
        let adaptor = OllamaAdaptor::new(Client::new());
        let request = RelayRequest::Embedding(EmbeddingRequest {
            model: "nomic-embed-text".into(),
            input: json!(["a", "b"]),
            ..Default::default()
        });
        let url = adaptor.build_upstream_url(&info).unwrap();
        let mut headers = HeaderMap::new();
        adaptor.build_headers(&info, &mut headers).await.unwrap();
        assert!(headers.is_empty());
        let body = adaptor.convert_request(&info, &request).unwrap();
        let response = adaptor.send(&info, &url, headers, body).await.unwrap();
        let outcome = adaptor.parse_response(&mut info, response).await.unwrap();
        assert_eq!(outcome.usage, Some(Usage::new(4, 0)));

        let bytes = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"][1]["index"], json!(1));
        assert_eq!(body["model"], json!("gpt-4"));
    }

    #[test]
    fn chat_uses_openai_compatible_path() {
        let info = bound(RelayMode::ChatCompletions, "http://localhost:11434");
        assert_eq!(
            OllamaAdaptor::new(Client::new()).build_upstream_url(&info).unwrap(),
            "http://localhost:11434/v1/chat/completions"
        );
    }
}
