use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dto::{AudioTranscriptionRequest, ChatCompletionResponse, Usage};
use crate::error::{ApiError, RelayError};
use crate::relay::convert;
use crate::relay::relay_info::{RelayFormat, RelayInfo};
use crate::relay::{AdaptorRegistry, RelayOutcome, RelayRequest, UpstreamBody};

/// 执行一次完整的上游调用：适配器初始化、转换、发送、解析
pub async fn relay_attempt(
    registry: &AdaptorRegistry,
    info: &mut RelayInfo,
    request: &RelayRequest,
) -> Result<RelayOutcome, RelayError> {
    let adaptor = registry.adaptor_for(info)?;

    let mut request = request.with_model(&info.upstream_model);
    if let RelayRequest::Claude(claude) = &request {
        if !adaptor.accepts_claude_format() {
            request = RelayRequest::Chat(convert::claude_request_to_openai(claude)?);
        }
    }

    let url = adaptor.build_upstream_url(info)?;
    let mut headers = HeaderMap::new();
    adaptor.build_headers(info, &mut headers).await?;
    let body = adaptor.convert_request(info, &request)?;

    debug!(
        "发送上游请求 [{}]: channel_id={}, adaptor={}, url={}",
        info.request_id,
        info.channel_id,
        adaptor.channel_name(),
        url
    );
    let response = adaptor.send(info, &url, headers, body).await?;

    if !response.status().is_success() {
        return Err(relay_error_from_response(response).await);
    }
    // 流式请求在首个有内容的帧到达时记录
    if !info.is_stream {
        info.mark_first_response();
    }
    let mut outcome = adaptor.parse_response(info, response).await?;
    outcome.first_response = info.first_response_latency();
    Ok(outcome)
}

/// 默认的上游发送实现
pub async fn do_request(
    client: &Client,
    info: &RelayInfo,
    url: &str,
    headers: HeaderMap,
    body: UpstreamBody,
) -> Result<reqwest::Response, RelayError> {
    let builder = client.post(url).headers(headers);
    let builder = match body {
        UpstreamBody::Json(value) => builder.json(&value),
        UpstreamBody::Multipart(request) => builder.multipart(multipart_form(request)?),
    };

    builder.send().await.map_err(|e| {
        warn!(
            "上游请求失败 [{}]: channel_id={}, error={}",
            info.request_id, info.channel_id, e
        );
        RelayError::Transport(e.to_string())
    })
}

fn multipart_form(request: AudioTranscriptionRequest) -> Result<Form, RelayError> {
    let mut part = Part::bytes(request.file.to_vec()).file_name(request.file_name);
    if let Some(content_type) = request.file_content_type {
        part = part
            .mime_str(&content_type)
            .map_err(|e| RelayError::bad_request(format!("invalid file content type: {}", e)))?;
    }
    let mut form = Form::new().text("model", request.model).part("file", part);
    for (name, value) in request.fields {
        form = form.text(name, value);
    }
    Ok(form)
}

/// 把非2xx的上游响应转换为结构化错误
pub async fn relay_error_from_response(response: reqwest::Response) -> RelayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RelayError::upstream(status, parse_error_body(status, &body))
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 识别 OpenAI / Claude / Gemini / 百度 / Cohere 的错误体
pub fn parse_error_body(status: u16, body: &str) -> ApiError {
    let fallback = || {
        let snippet: String = body.chars().take(200).collect();
        let message = if snippet.trim().is_empty() {
            format!("bad response status code {}", status)
        } else {
            format!("bad response status code {}, body: {}", status, snippet.trim())
        };
        ApiError::new(message, "upstream_error").with_code(status.to_string())
    };

    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return fallback();
    };

    let mut error = match value.get("error") {
        Some(Value::Object(obj)) => ApiError {
            message: obj.get("message").and_then(value_to_string).unwrap_or_default(),
            error_type: obj
                .get("type")
                .or_else(|| obj.get("status"))
                .and_then(value_to_string)
                .unwrap_or_else(|| "upstream_error".to_string()),
            param: obj.get("param").and_then(value_to_string),
            code: obj.get("code").and_then(value_to_string),
        },
        Some(Value::String(message)) => ApiError::new(message.clone(), "upstream_error"),
        _ => {
            let message = value
                .get("error_msg")
                .or_else(|| value.get("message"))
                .or_else(|| value.get("msg"))
                .and_then(value_to_string)
                .unwrap_or_default();
            let mut error = ApiError::new(message, "upstream_error");
            error.code = value.get("error_code").and_then(value_to_string);
            error
        }
    };

    if error.message.is_empty() {
        return fallback();
    }
    if error.code.is_none() {
        error.code = Some(status.to_string());
    }
    error
}

/// 读取完整响应体
pub async fn read_body(response: reqwest::Response) -> Result<Bytes, RelayError> {
    response
        .bytes()
        .await
        .map_err(|e| RelayError::Transport(format!("read response body failed: {}", e)))
}

pub fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RelayError> {
    serde_json::from_slice(body).map_err(|e| {
        RelayError::upstream(
            500,
            ApiError::new(format!("unmarshal response body failed: {}", e), "upstream_error")
                .with_code("bad_response_body"),
        )
    })
}

/// 上游返回2xx但JSON里带着错误（百度、智谱等）
pub fn embedded_error(body: &Value) -> Option<RelayError> {
    let has_error = body.get("error_code").map_or(false, |c| !c.is_null() && c != 0)
        || matches!(body.get("error"), Some(Value::Object(_)));
    has_error.then(|| RelayError::upstream(500, parse_error_body(500, &body.to_string())))
}

pub fn json_bytes_response(status: StatusCode, body: Bytes) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// 规范聊天响应按客户端格式输出
pub fn chat_response(
    info: &RelayInfo,
    response: ChatCompletionResponse,
) -> Result<RelayOutcome, RelayError> {
    if info.check_empty_response && response.is_empty() {
        return Err(RelayError::EmptyResponse);
    }
    let usage = response.usage;
    let response = match info.relay_format {
        RelayFormat::OpenAI => Json(response).into_response(),
        RelayFormat::Claude => {
            Json(convert::openai_response_to_claude(&response, &info.origin_model)).into_response()
        }
    };
    Ok(RelayOutcome::new(response, usage))
}

/// OpenAI兼容上游的非流式聊天响应，OpenAI格式客户端原样转发
pub async fn openai_chat_response(
    info: &RelayInfo,
    response: reqwest::Response,
) -> Result<RelayOutcome, RelayError> {
    let body = read_body(response).await?;
    if body.is_empty() {
        if info.check_empty_response {
            return Err(RelayError::EmptyResponse);
        }
        return Ok(RelayOutcome::new(
            json_bytes_response(StatusCode::OK, body),
            None,
        ));
    }

    let parsed: ChatCompletionResponse = parse_json(&body)?;
    match info.relay_format {
        RelayFormat::OpenAI => {
            if info.check_empty_response && parsed.is_empty() {
                return Err(RelayError::EmptyResponse);
            }
            Ok(RelayOutcome::new(
                json_bytes_response(StatusCode::OK, body),
                parsed.usage,
            ))
        }
        RelayFormat::Claude => chat_response(info, parsed),
    }
}

/// 其余接口（embeddings、图片、rerank等）原样转发，尽量解析用量
pub async fn passthrough_response(
    info: &RelayInfo,
    response: reqwest::Response,
) -> Result<RelayOutcome, RelayError> {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = read_body(response).await?;

    if body.is_empty() && info.check_empty_response {
        return Err(RelayError::EmptyResponse);
    }
    let usage = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("usage").cloned())
        .and_then(|u| serde_json::from_value::<Usage>(u).ok());

    Ok(RelayOutcome::new(
        (status, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        usage,
    ))
}

/// 二进制响应（语音合成）边读边转发
pub fn binary_passthrough(response: reqwest::Response) -> Result<RelayOutcome, RelayError> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let response = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| RelayError::Transport(e.to_string()))?;
    Ok(RelayOutcome::new(response, None))
}
