#![allow(dead_code)]

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use relay_gateway::config::AppConfig;
use relay_gateway::database::{
    memory_pool, ChannelStore, SqliteChannelStore, SqliteTokenStore, TokenStore,
};
use relay_gateway::models::{Channel, ChannelSetting, ChannelStatus, ChannelType, TokenInfo};
use relay_gateway::routes::{app_routes, AppState};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower::ServiceExt;

pub const CLIENT_KEY: &str = "sk-client";
pub const ADMIN_TOKEN: &str = "admin-secret";

pub struct TestApp {
    pub router: Router,
    pub pool: SqlitePool,
}

impl TestApp {
    pub async fn new(config: AppConfig) -> Self {
        let mut config = config;
        config.auth.admin_token = ADMIN_TOKEN.to_string();
        let pool = memory_pool().await.unwrap();
        SqliteTokenStore::new(pool.clone())
            .insert_token(CLIENT_KEY, &token(None))
            .await
            .unwrap();
        let state = AppState::build(&config, pool.clone()).await.unwrap();
        Self {
            router: app_routes(state, &config.server),
            pool,
        }
    }

    pub async fn add_channel(&self, channel: Channel) -> i64 {
        SqliteChannelStore::new(self.pool.clone())
            .insert_channel(&channel)
            .await
            .unwrap()
    }

    pub async fn add_token(&self, key: &str, token: TokenInfo) {
        SqliteTokenStore::new(self.pool.clone())
            .insert_token(key, &token)
            .await
            .unwrap();
    }

    pub async fn channel(&self, id: i64) -> Channel {
        SqliteChannelStore::new(self.pool.clone())
            .get_channel(id)
            .await
            .unwrap()
            .unwrap()
    }

    /// 等待后台健康任务把渠道改成指定状态
    pub async fn wait_for_status(&self, id: i64, status: ChannelStatus) -> bool {
        for _ in 0..50 {
            if self.channel(id).await.status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn chat(&self, key: &str, model: &str) -> (StatusCode, Value) {
        self.send(
            Request::post("/v1/chat/completions")
                .header("authorization", format!("Bearer {}", key))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": model,
                        "messages": [{"role": "user", "content": "hello"}]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
    }

    pub async fn admin(&self, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
            .header("content-type", "application/json");
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();
        self.send(request).await
    }
}

pub fn token(channel_id: Option<i64>) -> TokenInfo {
    TokenInfo {
        id: 0,
        name: "client".to_string(),
        group: "default".to_string(),
        enabled: true,
        channel_id,
    }
}

pub fn openai_channel(base_url: &str, models: &[&str], priority: i64) -> Channel {
    Channel {
        id: 0,
        name: format!("openai-{}", priority),
        channel_type: ChannelType::OpenAI,
        status: ChannelStatus::Enabled,
        base_url: Some(base_url.to_string()),
        key: "sk-upstream".to_string(),
        models: models.iter().map(|m| m.to_string()).collect(),
        groups: vec!["default".to_string()],
        priority,
        weight: 1,
        auto_ban: true,
        model_mapping: None,
        setting: ChannelSetting::default(),
        test_model: None,
        created_time: 0,
    }
}

pub fn chat_completion(model: &str, content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
    })
}

pub fn upstream_error(message: &str, error_type: &str) -> Value {
    json!({"error": {"message": message, "type": error_type}})
}
