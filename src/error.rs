use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::relay::relay_info::RelayFormat;

/// 上游429时返回给客户端的统一提示
pub const SATURATED_MESSAGE: &str = "当前分组上游负载已饱和，请稍后再试";

/// OpenAI风格的错误体
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ApiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            param: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// `{"error": {...}}` 外层包装
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ApiError,
}

/// 中转过程中的错误分类
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// 请求本身有问题或无法转换，不重试、不禁用渠道
    #[error("{message}")]
    Local {
        status: u16,
        code: String,
        message: String,
    },
    /// 该渠道类型不支持的功能组合
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// 连接、TLS、超时等网络层错误
    #[error("do request failed: {0}")]
    Transport(String),
    /// 上游返回的结构化错误
    #[error("{}", .error.message)]
    Upstream { status: u16, error: ApiError },
    /// 上游返回2xx但没有任何内容
    #[error("upstream returned an empty response")]
    EmptyResponse,
    #[error("no available channel for model {model} under group {group}")]
    NoChannel { group: String, model: String },
}

impl RelayError {
    pub fn local(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::Local {
            status: status.as_u16(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::local(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::local(StatusCode::UNAUTHORIZED, "invalid_api_key", message)
    }

    pub fn upstream(status: u16, error: ApiError) -> Self {
        RelayError::Upstream { status, error }
    }

    /// 是否为本地错误（请求缺陷），这类错误不会重试也不会影响渠道健康
    pub fn is_local(&self) -> bool {
        matches!(self, RelayError::Local { .. } | RelayError::NotImplemented(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Local { status, .. } => *status,
            RelayError::NotImplemented(_) => 501,
            RelayError::Transport(_) => 500,
            RelayError::Upstream { status, .. } => *status,
            RelayError::EmptyResponse => 500,
            RelayError::NoChannel { .. } => 503,
        }
    }

    /// 转成OpenAI风格的错误体
    pub fn api_error(&self) -> ApiError {
        match self {
            RelayError::Local { code, message, .. } => {
                ApiError::new(message.clone(), "invalid_request_error").with_code(code.clone())
            }
            RelayError::NotImplemented(message) => {
                ApiError::new(message.clone(), "invalid_request_error").with_code("not_implemented")
            }
            RelayError::Transport(_) => {
                ApiError::new(self.to_string(), "upstream_error").with_code("do_request_failed")
            }
            RelayError::Upstream { error, .. } => error.clone(),
            RelayError::EmptyResponse => {
                ApiError::new(self.to_string(), "upstream_error").with_code("empty_response")
            }
            RelayError::NoChannel { .. } => {
                ApiError::new(self.to_string(), "new_api_error").with_code("get_channel_failed")
            }
        }
    }

    /// 最终返回给客户端的错误：429统一改写，并附加请求ID
    pub fn client_error(&self, request_id: &str) -> ApiError {
        let mut error = self.api_error();
        if self.status_code() == 429 {
            error.message = SATURATED_MESSAGE.to_string();
        }
        if !request_id.is_empty() {
            error.message = format!("{} (request id: {})", error.message, request_id);
        }
        error
    }

    /// 按客户端使用的协议格式渲染错误响应
    pub fn into_response_with(self, format: RelayFormat, request_id: &str) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error = self.client_error(request_id);
        let body = match format {
            RelayFormat::OpenAI => json!({ "error": error }),
            RelayFormat::Claude => json!({
                "type": "error",
                "error": {
                    "type": claude_error_type(status, &error.error_type),
                    "message": error.message,
                }
            }),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.into_response_with(RelayFormat::OpenAI, "")
    }
}

/// Claude错误类型按状态码归类
fn claude_error_type(status: StatusCode, fallback: &str) -> String {
    let mapped = match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        500..=599 => "api_error",
        _ => fallback,
    };
    mapped.to_string()
}
