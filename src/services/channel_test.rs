use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::database::channel_store::ChannelStore;
use crate::dto::{ChatCompletionRequest, Message};
use crate::error::RelayError;
use crate::models::channel::{Channel, ChannelStatus};
use crate::models::token::TokenInfo;
use crate::relay::{helper, AdaptorRegistry, RelayFormat, RelayInfo, RelayMode, RelayRequest};
use crate::services::channel_health::ChannelHealthManager;

const PROBE_MAX_TOKENS: u32 = 16;

/// 一次渠道探测的结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProbeResult {
    pub channel_id: i64,
    pub success: bool,
    /// 耗时(毫秒)
    pub elapsed_ms: i64,
    pub message: String,
}

/// 渠道探测：发一个最小的聊天请求，按结果禁用或启用渠道
pub struct ChannelTester {
    registry: Arc<AdaptorRegistry>,
    store: Arc<dyn ChannelStore>,
    health: Arc<ChannelHealthManager>,
}

impl ChannelTester {
    pub fn new(
        registry: Arc<AdaptorRegistry>,
        store: Arc<dyn ChannelStore>,
        health: Arc<ChannelHealthManager>,
    ) -> Self {
        Self {
            registry,
            store,
            health,
        }
    }

    /// 按ID探测渠道，渠道不存在时返回 `None`
    pub async fn test_channel(&self, channel_id: i64) -> Result<Option<ProbeResult>> {
        let Some(channel) = self.store.get_channel(channel_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.probe(&channel).await))
    }

    /// 探测全部未被手动禁用的渠道
    pub async fn test_all(&self) -> Result<Vec<ProbeResult>> {
        let channels = self.store.list_channels().await?;
        let mut results = Vec::with_capacity(channels.len());
        for channel in channels
            .iter()
            .filter(|c| c.status != ChannelStatus::ManuallyDisabled)
        {
            results.push(self.probe(channel).await);
        }
        Ok(results)
    }

    pub async fn probe(&self, channel: &Channel) -> ProbeResult {
        let started = Instant::now();
        let outcome = self.send_probe(channel).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                info!(
                    "渠道探测成功: channel_id={}, name={}, 耗时={}ms",
                    channel.id, channel.name, elapsed_ms
                );
                if let Err(e) = self.store.record_test(channel.id, elapsed_ms).await {
                    error!("记录渠道 #{} 探测耗时失败: {}", channel.id, e);
                }
                if self.health.rules().should_enable(None, channel.status) {
                    if let Err(e) = self.health.enable_channel(channel.id, &channel.name).await {
                        error!("启用渠道 #{} 失败: {}", channel.id, e);
                    }
                }
                ProbeResult {
                    channel_id: channel.id,
                    success: true,
                    elapsed_ms,
                    message: String::new(),
                }
            }
            Err(err) => {
                warn!(
                    "渠道探测失败: channel_id={}, name={}, status={}, error={}",
                    channel.id,
                    channel.name,
                    err.status_code(),
                    err
                );
                if channel.auto_ban
                    && self.health.rules().should_disable(channel.channel_type, &err)
                {
                    if let Err(e) = self
                        .health
                        .disable_channel(channel.id, &channel.name, &err.to_string())
                        .await
                    {
                        error!("禁用渠道 #{} 失败: {}", channel.id, e);
                    }
                }
                ProbeResult {
                    channel_id: channel.id,
                    success: false,
                    elapsed_ms,
                    message: err.to_string(),
                }
            }
        }
    }

    async fn send_probe(&self, channel: &Channel) -> Result<(), RelayError> {
        let model = channel
            .probe_model()
            .ok_or_else(|| RelayError::bad_request("channel has no model to test with"))?
            .to_string();
        let upstream_model = channel
            .map_model(&model)
            .map_err(|e| RelayError::bad_request(format!("invalid channel model mapping: {}", e)))?
            .unwrap_or_else(|| model.clone());

        let token = TokenInfo {
            id: 0,
            name: "channel-test".to_string(),
            group: channel
                .groups
                .first()
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            enabled: true,
            channel_id: Some(channel.id),
        };
        let request_id = format!("test-{}", uuid::Uuid::new_v4().simple());
        let base = RelayInfo::new(
            request_id,
            RelayMode::ChatCompletions,
            RelayFormat::OpenAI,
            &token,
            model.clone(),
            false,
        );
        let mut info = base.bind_channel(channel, &upstream_model);
        let request = RelayRequest::Chat(ChatCompletionRequest {
            model,
            messages: vec![Message::text("user", "hi")],
            max_tokens: Some(PROBE_MAX_TOKENS),
            ..Default::default()
        });

        helper::relay_attempt(&self.registry, &mut info, &request)
            .await
            .map(|_| ())
    }
}

/// 定期探测全部渠道，间隔为0时不启动
pub fn spawn_periodic_probe(tester: Arc<ChannelTester>, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    let handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        // 第一次 tick 立即返回，跳过启动时的探测
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!("开始定期渠道探测");
            match tester.test_all().await {
                Ok(results) => {
                    let failed = results.iter().filter(|r| !r.success).count();
                    info!("定期渠道探测完成: 共{}个, 失败{}个", results.len(), failed);
                }
                Err(e) => error!("定期渠道探测失败: {}", e),
            }
        }
    });
    Some(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel_store::MockChannelStore;
    use crate::models::channel::test_channel;
    use crate::services::channel_health::HealthRules;
    use crate::services::channel_selector::ChannelSelector;
    use crate::services::notifier::MockNotifier;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tester(store: MockChannelStore) -> ChannelTester {
        let store: Arc<dyn ChannelStore> = Arc::new(store);
        let selector = Arc::new(ChannelSelector::new(store.clone(), Duration::from_secs(60)));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(|_, _| Ok(()));
        let health = Arc::new(ChannelHealthManager::new(
            HealthRules::new(true, true, &[]),
            store.clone(),
            selector,
            Arc::new(notifier),
        ));
        let registry = Arc::new(AdaptorRegistry::new(Duration::from_secs(5)).unwrap());
        ChannelTester::new(registry, store, health)
    }

    #[tokio::test]
    async fn successful_probe_enables_auto_disabled_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "gpt-4-0613", "max_tokens": 16})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4-0613",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            })))
            .mount(&server)
            .await;

        let mut channel = test_channel(4);
        channel.base_url = Some(server.uri());
        channel.status = ChannelStatus::AutoDisabled;
        channel.model_mapping = Some(r#"{"gpt-4":"gpt-4-0613"}"#.to_string());

        let mut store = MockChannelStore::new();
        store
            .expect_get_channel()
            .with(eq(4))
            .returning(move |_| Ok(Some(channel.clone())));
        store.expect_record_test().times(1).returning(|_, _| Ok(()));
        store
            .expect_update_status()
            .withf(|id, status, _| *id == 4 && *status == ChannelStatus::Enabled)
            .times(1)
            .returning(|_, _, _| Ok(true));

        let result = tester(store).test_channel(4).await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.channel_id, 4);
    }

    #[tokio::test]
    async fn unauthorized_probe_disables_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "code": "invalid_api_key"}
            })))
            .mount(&server)
            .await;

        let mut channel = test_channel(5);
        channel.base_url = Some(server.uri());

        let mut store = MockChannelStore::new();
        store
            .expect_get_channel()
            .returning(move |_| Ok(Some(channel.clone())));
        store.expect_record_test().never();
        store
            .expect_update_status()
            .withf(|id, status, _| *id == 5 && *status == ChannelStatus::AutoDisabled)
            .times(1)
            .returning(|_, _, _| Ok(true));

        let result = tester(store).test_channel(5).await.unwrap().unwrap();
        assert!(!result.success);
        assert!(result.message.contains("Incorrect API key"));
    }

    #[tokio::test]
    async fn missing_channel_yields_none() {
        let mut store = MockChannelStore::new();
        store.expect_get_channel().returning(|_| Ok(None));
        assert!(tester(store).test_channel(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_interval_does_not_spawn() {
        let store = MockChannelStore::new();
        assert!(spawn_periodic_probe(Arc::new(tester(store)), 0).is_none());
    }
}
