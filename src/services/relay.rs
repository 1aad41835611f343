use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use axum::http::StatusCode;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::database::channel_store::ChannelStore;
use crate::error::RelayError;
use crate::models::channel::Channel;
use crate::relay::realtime::{self, UpstreamSocket};
use crate::relay::{helper, AdaptorRegistry, RelayInfo, RelayOutcome, RelayRequest};
use crate::services::channel_health::{FailureReport, HealthReporter};
use crate::services::channel_selector::ChannelSelector;
use crate::services::model_mapper::ModelMappingService;
use crate::services::retry_policy::RetryPolicy;

/// 中转编排：解析模型 → 选渠道 → 调用适配器 → 分类结果 → 重试或返回
pub struct RelayService {
    selector: Arc<ChannelSelector>,
    mapper: Arc<ModelMappingService>,
    registry: Arc<AdaptorRegistry>,
    store: Arc<dyn ChannelStore>,
    reporter: HealthReporter,
    policy: RetryPolicy,
    max_retries: u32,
    force_channel_switch: bool,
}

impl RelayService {
    pub fn new(
        config: &RelayConfig,
        selector: Arc<ChannelSelector>,
        mapper: Arc<ModelMappingService>,
        registry: Arc<AdaptorRegistry>,
        store: Arc<dyn ChannelStore>,
        reporter: HealthReporter,
    ) -> Self {
        Self {
            selector,
            mapper,
            registry,
            store,
            reporter,
            policy: RetryPolicy::from_config(config),
            max_retries: config.max_retries(),
            force_channel_switch: config.auto_retry.enabled && config.auto_retry.force_channel_switch,
        }
    }

    /// 中转一个HTTP请求
    pub async fn relay(
        &self,
        info: RelayInfo,
        request: RelayRequest,
    ) -> Result<RelayOutcome, RelayError> {
        let registry = self.registry.as_ref();
        let request = &request;
        let request_id = info.request_id.clone();
        let (mut outcome, visited) = self
            .run(info, move |mut bound| async move {
                helper::relay_attempt(registry, &mut bound, request).await
            })
            .await?;
        if let Some(latency) = outcome.first_response {
            info!(
                "首字耗时 [{}]: {}ms, usage={:?}",
                request_id,
                latency.as_millis(),
                outcome.usage
            );
        }
        outcome.tried_channels = visited;
        Ok(outcome)
    }

    /// 建立 realtime 上游连接，握手失败与HTTP请求一样参与重试
    pub async fn connect_realtime(
        &self,
        info: RelayInfo,
    ) -> Result<(UpstreamSocket, RelayInfo), RelayError> {
        let registry = self.registry.as_ref();
        let (connected, _) = self
            .run(info, move |bound| async move {
                let socket = realtime::connect_upstream(registry, &bound).await?;
                Ok((socket, bound))
            })
            .await?;
        Ok(connected)
    }

    /// 重试循环，`attempt` 对每个绑定了渠道的上下文执行一次尝试；
    /// 成功时一并返回依次尝试过的渠道
    async fn run<T, F, Fut>(
        &self,
        mut info: RelayInfo,
        mut attempt: F,
    ) -> Result<(T, Vec<i64>), RelayError>
    where
        F: FnMut(RelayInfo) -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let resolved = self.mapper.resolve(&info.origin_model);
        info.set_resolved_model(resolved);
        if info.is_model_mapped {
            info!(
                "虚拟模型解析 [{}]: {} -> {}",
                info.request_id, info.origin_model, info.upstream_model
            );
        }
        info.check_empty_response = self.policy.auto_retry_enabled();

        let mut visited: Vec<i64> = Vec::new();
        let mut tried: Vec<i64> = Vec::new();
        let mut last_error: Option<RelayError> = None;

        for i in 0..=self.max_retries {
            let remaining = self.max_retries - i;
            let channel = match self.pick_channel(&info, i as usize, &tried).await {
                Ok(channel) => channel,
                // 重试时已无渠道可选，返回上一次的错误
                Err(e) if last_error.is_some() => {
                    warn!("重试选择渠道失败 [{}]: {}", info.request_id, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            visited.push(channel.id);

            let upstream_model = channel
                .map_model(&info.upstream_model)
                .map_err(|e| {
                    RelayError::bad_request(format!(
                        "invalid model mapping of channel #{}: {}",
                        channel.id, e
                    ))
                })?
                .unwrap_or_else(|| info.upstream_model.clone());
            let bound = info.bind_channel(&channel, &upstream_model);

            match attempt(bound).await {
                Ok(value) => {
                    info!(
                        "中转成功 [{}]: channel_id={}, model={}, attempt={}",
                        info.request_id,
                        channel.id,
                        upstream_model,
                        i + 1
                    );
                    log_visits(&info.request_id, &visited);
                    return Ok((value, visited));
                }
                Err(e) => {
                    let retry =
                        self.policy
                            .should_retry(&e, channel.channel_type, info.is_pinned(), remaining);
                    warn!(
                        "中转失败 [{}]: channel_id={}, status={}, retry={}, error={}",
                        info.request_id,
                        channel.id,
                        e.status_code(),
                        retry,
                        e
                    );
                    if !e.is_local() {
                        self.reporter.report(FailureReport {
                            request_id: info.request_id.clone(),
                            channel_id: channel.id,
                            channel_type: channel.channel_type,
                            channel_name: channel.name.clone(),
                            auto_ban: channel.auto_ban,
                            error: e.clone(),
                        });
                    }
                    tried.push(channel.id);
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                }
            }
        }

        log_visits(&info.request_id, &visited);
        Err(last_error.unwrap_or_else(|| RelayError::NoChannel {
            group: info.group.clone(),
            model: info.upstream_model.clone(),
        }))
    }

    async fn pick_channel(
        &self,
        info: &RelayInfo,
        retry_index: usize,
        tried: &[i64],
    ) -> Result<Channel, RelayError> {
        if let Some(channel_id) = info.pinned_channel {
            let channel = self.store.get_channel(channel_id).await.map_err(|e| {
                error!("查询渠道 #{} 失败: {}", channel_id, e);
                RelayError::local(StatusCode::INTERNAL_SERVER_ERROR, "get_channel_failed", e.to_string())
            })?;
            return match channel {
                Some(channel) if channel.is_enabled() => Ok(channel),
                _ => Err(RelayError::local(
                    StatusCode::FORBIDDEN,
                    "channel_unavailable",
                    format!("pinned channel #{} is not available", channel_id),
                )),
            };
        }

        let attempt_index = if self.force_channel_switch && retry_index > 0 {
            retry_index + 1
        } else {
            retry_index
        };
        let selected = self
            .selector
            .select(&info.group, &info.upstream_model, attempt_index, tried)
            .await
            .map_err(|e| {
                error!("查询可用渠道失败 [{}]: {}", info.request_id, e);
                RelayError::local(StatusCode::INTERNAL_SERVER_ERROR, "get_channel_failed", e.to_string())
            })?;
        selected.ok_or_else(|| RelayError::NoChannel {
            group: info.group.clone(),
            model: info.upstream_model.clone(),
        })
    }

    /// 某分组可用的模型：渠道类型的模型目录、渠道声明的模型与虚拟模型的并集
    pub async fn available_models(&self, group: &str) -> anyhow::Result<Vec<String>> {
        let channels = self.store.list_channels().await?;
        let mut models = BTreeSet::new();
        for channel in channels
            .iter()
            .filter(|c| c.is_enabled() && c.in_group(group))
        {
            models.extend(self.registry.supported_models(channel.channel_type));
            models.extend(channel.models.iter().cloned());
        }
        models.extend(self.mapper.virtual_models());
        Ok(models.into_iter().collect())
    }
}

fn log_visits(request_id: &str, visited: &[i64]) {
    if visited.len() > 1 {
        let chain = visited
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("->");
        info!("重试 [{}]：{}", request_id, chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoRetryConfig;
    use crate::database::channel_store::MockChannelStore;
    use crate::database::option_store::MockOptionStore;
    use crate::dto::{ChatCompletionRequest, Message};
    use crate::models::channel::{test_channel, ChannelStatus};
    use crate::models::token::TokenInfo;
    use crate::relay::{RelayFormat, RelayMode};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }))
    }

    fn failure(status: u16) -> ResponseTemplate {
        ResponseTemplate::new(status).set_body_json(json!({
            "error": {"message": format!("status {}", status), "type": "upstream_error"}
        }))
    }

    struct Harness {
        service: RelayService,
        reports: mpsc::Receiver<FailureReport>,
    }

    fn harness(channel: Channel, config: RelayConfig) -> Harness {
        harness_with(vec![channel], config)
    }

    fn harness_with(channels: Vec<Channel>, config: RelayConfig) -> Harness {
        let mut store = MockChannelStore::new();
        let listed = channels.clone();
        store
            .expect_find_channels()
            .returning(move |_, _| Ok(listed.clone()));
        store
            .expect_get_channel()
            .returning(move |id| Ok(channels.iter().find(|c| c.id == id).cloned()));
        let store: Arc<dyn ChannelStore> = Arc::new(store);

        let mut options = MockOptionStore::new();
        options.expect_get_option().returning(|_| Ok(None));
        let mapper = Arc::new(ModelMappingService::new(Arc::new(options)));
        let selector = Arc::new(ChannelSelector::new(store.clone(), Duration::from_secs(60)));
        let registry = Arc::new(AdaptorRegistry::new(Duration::from_secs(5)).unwrap());
        let (tx, reports) = mpsc::channel(16);

        Harness {
            service: RelayService::new(
                &config,
                selector,
                mapper,
                registry,
                store,
                HealthReporter::new(tx),
            ),
            reports,
        }
    }

    fn retrying(count: u32) -> RelayConfig {
        RelayConfig {
            retry_times: count,
            ..Default::default()
        }
    }

    fn request_info(pinned: Option<i64>) -> (RelayInfo, RelayRequest) {
        let token = TokenInfo {
            id: 1,
            name: "t".into(),
            group: "default".into(),
            enabled: true,
            channel_id: pinned,
        };
        let info = RelayInfo::new(
            "req-1",
            RelayMode::ChatCompletions,
            RelayFormat::OpenAI,
            &token,
            "gpt-4",
            false,
        );
        let request = RelayRequest::Chat(ChatCompletionRequest {
            model: "gpt-4".into(),
            messages: vec![Message::text("user", "hello")],
            ..Default::default()
        });
        (info, request)
    }

    async fn channel_at(server: &MockServer) -> Channel {
        let mut channel = test_channel(1);
        channel.base_url = Some(server.uri());
        channel
    }

    #[tokio::test]
    async fn retries_rate_limit_and_server_error_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(failure(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(failure(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(chat_ok())
            .mount(&server)
            .await;

        let mut h = harness(channel_at(&server).await, retrying(3));
        let (info, request) = request_info(None);
        let outcome = h.service.relay(info, request).await.unwrap();
        assert_eq!(outcome.usage.map(|u| u.total_tokens), Some(4));
        assert!(outcome.first_response.is_some());
        assert_eq!(outcome.tried_channels, vec![1, 1, 1]);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert_eq!(h.reports.recv().await.unwrap().error.status_code(), 429);
        assert_eq!(h.reports.recv().await.unwrap().error.status_code(), 500);
    }

    #[tokio::test]
    async fn gateway_timeout_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(failure(504))
            .mount(&server)
            .await;

        let h = harness(channel_at(&server).await, retrying(3));
        let (info, request) = request_info(None);
        let err = h.service.relay(info, request).await.unwrap_err();
        assert_eq!(err.status_code(), 504);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pinned_token_never_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(failure(500))
            .mount(&server)
            .await;

        let h = harness(channel_at(&server).await, retrying(3));
        let (info, request) = request_info(Some(1));
        let err = h.service.relay(info, request).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_response_is_retried_only_with_auto_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": ""}, "finish_reason": "stop"}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(chat_ok())
            .mount(&server)
            .await;

        let config = RelayConfig {
            auto_retry: AutoRetryConfig {
                enabled: true,
                count: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = harness(channel_at(&server).await, config);
        let (info, request) = request_info(None);
        assert!(h.service.relay(info, request).await.is_ok());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn local_errors_are_not_reported() {
        let mut channel = test_channel(1);
        channel.model_mapping = Some("{broken".into());
        let mut h = harness(channel, retrying(3));
        let (info, request) = request_info(None);
        let err = h.service.relay(info, request).await.unwrap_err();
        assert!(err.is_local());
        assert!(h.reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_pinned_channel_is_rejected() {
        let mut channel = test_channel(1);
        channel.status = ChannelStatus::ManuallyDisabled;
        let h = harness(channel, retrying(0));
        let (info, request) = request_info(Some(1));
        let err = h.service.relay(info, request).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    async fn tiered_channels(statuses: &[(i64, i64, ResponseTemplate)]) -> (Vec<MockServer>, Vec<Channel>) {
        let mut servers = Vec::new();
        let mut channels = Vec::new();
        for (id, priority, template) in statuses {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(template.clone())
                .mount(&server)
                .await;
            let mut channel = test_channel(*id);
            channel.priority = *priority;
            channel.base_url = Some(server.uri());
            channels.push(channel);
            servers.push(server);
        }
        (servers, channels)
    }

    #[tokio::test]
    async fn forced_switch_skips_ahead_and_never_repeats_a_channel() {
        let (servers, channels) = tiered_channels(&[
            (1, 30, failure(500)),
            (2, 20, chat_ok()),
            (3, 10, failure(500)),
        ])
        .await;
        let config = RelayConfig {
            auto_retry: AutoRetryConfig {
                enabled: true,
                count: 3,
                force_channel_switch: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = harness_with(channels, config);
        let (info, request) = request_info(None);
        let outcome = h.service.relay(info, request).await.unwrap();

        // 第一次重试跳过一个档位，随后回到剩下未尝试的渠道
        assert_eq!(outcome.tried_channels, vec![1, 3, 2]);
        for server in &servers {
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn without_forced_switch_retries_walk_tiers_in_order() {
        let (servers, channels) = tiered_channels(&[
            (1, 30, failure(500)),
            (2, 20, failure(500)),
            (3, 10, chat_ok()),
        ])
        .await;
        let h = harness_with(channels, retrying(3));
        let (info, request) = request_info(None);
        let outcome = h.service.relay(info, request).await.unwrap();

        assert_eq!(outcome.tried_channels, vec![1, 2, 3]);
        for server in &servers {
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }
    }
}
