use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error};

use crate::error::RelayError;
use crate::relay::channel::set_bearer;
use crate::relay::stream;
use crate::relay::{
    helper, model_list, Adaptor, RelayFormat, RelayInfo, RelayMode, RelayOutcome, RelayRequest,
    UpstreamBody,
};
use crate::services::ttl_cache::TtlCache;

/// 签发的令牌有效期
pub const TOKEN_TTL_SECS: u64 = 24 * 3600;

/// 缓存比令牌本身早过期，避免请求途中失效
const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

const MODELS: &[&str] = &[
    "glm-4",
    "glm-4v",
    "glm-4-plus",
    "glm-4-air",
    "glm-4-airx",
    "glm-4-flash",
    "glm-4v-plus",
    "glm-z1-flash",
    "glm-4.5",
    "glm-4.5-flash",
    "embedding-3",
];

pub struct ZhipuAdaptor {
    client: Client,
    tokens: Arc<TtlCache<String, String>>,
}

impl ZhipuAdaptor {
    pub fn new(client: Client, tokens: Arc<TtlCache<String, String>>) -> Self {
        Self { client, tokens }
    }

    /// 取缓存的令牌，过期后按 `id.secret` 重新签发
    fn token(&self, api_key: &str) -> Result<String, RelayError> {
        if let Some(token) = self.tokens.get(&api_key.to_string()) {
            return Ok(token);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let token = sign_token(api_key, now_ms)?;
        self.tokens.insert_with_ttl(
            api_key.to_string(),
            token.clone(),
            Duration::from_secs(TOKEN_TTL_SECS - TOKEN_REFRESH_MARGIN_SECS),
        );
        debug!("智谱令牌已签发");
        Ok(token)
    }
}

/// 签发 HS256 JWT，头部带 `sign_type: SIGN`，时间均为毫秒
pub fn sign_token(api_key: &str, now_ms: i64) -> Result<String, RelayError> {
    let Some((id, secret)) = api_key.split_once('.').filter(|(id, secret)| {
        !id.is_empty() && !secret.is_empty() && !secret.contains('.')
    }) else {
        error!("智谱密钥格式错误，应为 id.secret");
        return Err(RelayError::bad_request("invalid zhipu key, expected id.secret"));
    };

    let header = json!({"alg": "HS256", "sign_type": "SIGN"});
    let claims = json!({
        "api_key": id,
        "exp": now_ms + (TOKEN_TTL_SECS as i64) * 1000,
        "timestamp": now_ms,
    });
    let message = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let signature = jsonwebtoken::crypto::sign(
        message.as_bytes(),
        &EncodingKey::from_secret(secret.as_bytes()),
        Algorithm::HS256,
    )
    .map_err(|e| RelayError::bad_request(format!("sign zhipu token failed: {}", e)))?;
    Ok(format!("{}.{}", message, signature))
}

#[async_trait]
impl Adaptor for ZhipuAdaptor {
    fn build_upstream_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let path = match info.relay_mode {
            RelayMode::ChatCompletions => "chat/completions",
            RelayMode::Embeddings => "embeddings",
            mode => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by zhipu channels",
                    mode
                )))
            }
        };
        Ok(format!("{}/api/paas/v4/{}", info.base_url, path))
    }

    async fn build_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        let token = self.token(&info.api_key)?;
        set_bearer(headers, &token)
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &RelayRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request {
            RelayRequest::Chat(chat) => {
                let mut chat = chat.clone();
                // v4 接口 top_p 需落在 (0, 1)
                chat.top_p = chat.top_p.map(|p| p.clamp(0.01, 0.99));
                chat.stream_options = None;
                serde_json::to_value(&chat)
            }
            RelayRequest::Embedding(embedding) => serde_json::to_value(embedding),
            _ => {
                return Err(RelayError::NotImplemented(format!(
                    "{:?} is not supported by zhipu channels",
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
            RelayMode::ChatCompletions if info.is_stream => {
                let passthrough = info.relay_format == RelayFormat::OpenAI;
                stream::respond_stream(info, stream::openai_frames(response, passthrough)).await
            }
            RelayMode::ChatCompletions => helper::openai_chat_response(info, response).await,
            _ => helper::passthrough_response(info, response).await,
        }
    }

    fn supported_models(&self) -> Vec<String> {
        model_list(MODELS)
    }

    fn channel_name(&self) -> &'static str {
        "zhipu_v4"
    }
}
