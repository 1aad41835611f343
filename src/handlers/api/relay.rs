use axum::{
    extract::{
        multipart::{Multipart, MultipartRejection},
        rejection::JsonRejection,
        ws::WebSocketUpgrade,
        Json, Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::dto::{
    AudioSpeechRequest, AudioTranscriptionRequest, ChatCompletionRequest, ClaudeRequest,
    CompletionRequest, EmbeddingRequest, ImageRequest, RerankRequest,
};
use crate::error::RelayError;
use crate::handlers::api::auth::{request_id, ClientToken};
use crate::relay::realtime;
use crate::relay::{RelayFormat, RelayInfo, RelayMode, RelayRequest};
use crate::routes::api::AppState;

/// 解析JSON请求体，失败时按本地错误返回
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RelayError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| RelayError::bad_request(format!("invalid request body: {}", e.body_text())))
}

fn require_model(model: &str) -> Result<(), RelayError> {
    if model.trim().is_empty() {
        return Err(RelayError::bad_request("model is required"));
    }
    Ok(())
}

/// 所有HTTP中转接口的公共流程
async fn dispatch(
    state: &AppState,
    token: ClientToken,
    headers: &HeaderMap,
    mode: RelayMode,
    format: RelayFormat,
    request: Result<RelayRequest, RelayError>,
) -> Response {
    let request_id = request_id(headers);
    let request = match request.and_then(|r| require_model(r.model()).map(|_| r)) {
        Ok(request) => request,
        Err(e) => return e.into_response_with(format, &request_id),
    };

    info!(
        "收到中转请求 [{}]: mode={:?}, model={}, stream={}, token_id={}",
        request_id,
        mode,
        request.model(),
        request.is_stream(),
        token.0.id
    );
    let info = RelayInfo::new(
        request_id.clone(),
        mode,
        format,
        &token.0,
        request.model(),
        request.is_stream(),
    );
    match state.relay.relay(info, request).await {
        Ok(outcome) => {
            if let Some(usage) = outcome.usage {
                debug!("请求用量 [{}]: {:?}", request_id, usage);
            }
            outcome.response
        }
        Err(e) => e.into_response_with(format, &request_id),
    }
}

/// 聊天补全
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "成功处理聊天请求（stream=true 时为SSE）"),
        (status = 400, description = "无效的请求", body = crate::error::ErrorResponse),
        (status = 401, description = "令牌无效", body = crate::error::ErrorResponse),
        (status = 503, description = "没有可用渠道", body = crate::error::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "relay"
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).and_then(|r| {
        if r.messages.is_empty() {
            return Err(RelayError::bad_request("messages must not be empty"));
        }
        Ok(RelayRequest::Chat(r))
    });
    dispatch(
        &state,
        token,
        &headers,
        RelayMode::ChatCompletions,
        RelayFormat::OpenAI,
        request,
    )
    .await
}

pub async fn completions(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).map(RelayRequest::Completion);
    dispatch(&state, token, &headers, RelayMode::Completions, RelayFormat::OpenAI, request).await
}

pub async fn embeddings(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).map(RelayRequest::Embedding);
    dispatch(&state, token, &headers, RelayMode::Embeddings, RelayFormat::OpenAI, request).await
}

pub async fn rerank(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<RerankRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).map(RelayRequest::Rerank);
    dispatch(&state, token, &headers, RelayMode::Rerank, RelayFormat::OpenAI, request).await
}

pub async fn image_generations(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).map(|mut r| {
        if r.model.trim().is_empty() {
            r.model = "dall-e-2".to_string();
        }
        RelayRequest::Image(r)
    });
    dispatch(
        &state,
        token,
        &headers,
        RelayMode::ImagesGenerations,
        RelayFormat::OpenAI,
        request,
    )
    .await
}

pub async fn audio_speech(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<AudioSpeechRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).map(RelayRequest::Speech);
    dispatch(&state, token, &headers, RelayMode::AudioSpeech, RelayFormat::OpenAI, request).await
}

/// 读取转写/翻译的 multipart 表单
async fn parse_audio_form(
    payload: Result<Multipart, MultipartRejection>,
) -> Result<RelayRequest, RelayError> {
    let mut multipart =
        payload.map_err(|e| RelayError::bad_request(format!("invalid multipart form: {}", e)))?;
    let mut request = AudioTranscriptionRequest::default();
    let mut has_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::bad_request(format!("invalid multipart form: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                request.file_name = field.file_name().unwrap_or("audio").to_string();
                request.file_content_type = field.content_type().map(str::to_string);
                request.file = field
                    .bytes()
                    .await
                    .map_err(|e| RelayError::bad_request(format!("read file failed: {}", e)))?;
                has_file = true;
            }
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| RelayError::bad_request(format!("read field {} failed: {}", name, e)))?;
                if name == "model" {
                    request.model = value;
                } else {
                    request.fields.push((name, value));
                }
            }
        }
    }

    if !has_file {
        return Err(RelayError::bad_request("file is required"));
    }
    Ok(RelayRequest::Transcription(request))
}

pub async fn audio_transcriptions(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Multipart, MultipartRejection>,
) -> Response {
    let request = parse_audio_form(payload).await;
    dispatch(
        &state,
        token,
        &headers,
        RelayMode::AudioTranscription,
        RelayFormat::OpenAI,
        request,
    )
    .await
}

pub async fn audio_translations(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Multipart, MultipartRejection>,
) -> Response {
    let request = parse_audio_form(payload).await;
    dispatch(
        &state,
        token,
        &headers,
        RelayMode::AudioTranslation,
        RelayFormat::OpenAI,
        request,
    )
    .await
}

/// Claude 格式的消息接口
pub async fn claude_messages(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    payload: Result<Json<ClaudeRequest>, JsonRejection>,
) -> Response {
    let request = parse_body(payload).and_then(|r| {
        if r.messages.is_empty() {
            return Err(RelayError::bad_request("messages must not be empty"));
        }
        Ok(RelayRequest::Claude(r))
    });
    dispatch(
        &state,
        token,
        &headers,
        RelayMode::ChatCompletions,
        RelayFormat::Claude,
        request,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    #[serde(default)]
    pub model: String,
}

/// Realtime：先连上游，成功后再升级客户端连接
pub async fn realtime(
    State(state): State<AppState>,
    token: ClientToken,
    headers: HeaderMap,
    Query(query): Query<RealtimeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let request_id = request_id(&headers);
    if let Err(e) = require_model(&query.model) {
        return e.into_response_with(RelayFormat::OpenAI, &request_id);
    }
    info!(
        "收到 realtime 请求 [{}]: model={}, token_id={}",
        request_id, query.model, token.0.id
    );

    let info = RelayInfo::new(
        request_id.clone(),
        RelayMode::Realtime,
        RelayFormat::OpenAI,
        &token.0,
        query.model,
        true,
    );
    match state.relay.connect_realtime(info).await {
        Ok((upstream, info)) => ws
            .protocols(["realtime"])
            .on_upgrade(move |socket| realtime::pump(socket, upstream, info)),
        Err(e) => e.into_response_with(RelayFormat::OpenAI, &request_id),
    }
}
