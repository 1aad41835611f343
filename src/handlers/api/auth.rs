use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use crate::error::RelayError;
use crate::handlers::api::AdminResponse;
use crate::models::token::TokenInfo;
use crate::relay::RelayFormat;
use crate::routes::api::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 浏览器端 realtime 通过子协议携带密钥
const REALTIME_KEY_PROTOCOL: &str = "openai-insecure-api-key.";

/// 取中间件生成的请求ID，缺失时现场生成
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// 依次尝试 Authorization、x-api-key 与 websocket 子协议
fn client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = bearer(headers) {
        return Some(key.to_string());
    }
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|protocols| {
            protocols
                .split(',')
                .map(str::trim)
                .find_map(|p| p.strip_prefix(REALTIME_KEY_PROTOCOL))
                .map(str::to_string)
        })
}

/// 已鉴权的客户端令牌
#[derive(Debug, Clone)]
pub struct ClientToken(pub TokenInfo);

#[async_trait]
impl FromRequestParts<AppState> for ClientToken {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let format = if parts.uri.path().starts_with("/v1/messages") {
            RelayFormat::Claude
        } else {
            RelayFormat::OpenAI
        };
        let request_id = request_id(&parts.headers);
        let reject = |message: &str| {
            RelayError::unauthorized(message).into_response_with(format, &request_id)
        };

        let Some(key) = client_key(&parts.headers) else {
            return Err(reject("missing api key"));
        };
        match state.tokens.find_token(&key).await {
            Ok(Some(token)) if token.enabled => Ok(ClientToken(token)),
            Ok(Some(token)) => {
                warn!("令牌已禁用: token_id={}", token.id);
                Err(reject("api key is disabled"))
            }
            Ok(None) => Err(reject("invalid api key")),
            Err(e) => {
                error!("查询令牌失败: {}", e);
                Err(RelayError::local(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "query_token_failed",
                    "failed to verify api key",
                )
                .into_response_with(format, &request_id))
            }
        }
    }
}

/// 管理接口鉴权，未配置管理令牌时一律拒绝
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let authorized = !state.admin_token.is_empty()
            && bearer(&parts.headers) == Some(state.admin_token.as_ref());
        if authorized {
            return Ok(AdminAuth);
        }
        warn!("管理接口鉴权失败: path={}", parts.uri.path());
        Err((
            StatusCode::UNAUTHORIZED,
            Json(AdminResponse::error("无权访问管理接口")),
        )
            .into_response())
    }
}
