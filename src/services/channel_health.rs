use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HealthCheckConfig;
use crate::database::channel_store::ChannelStore;
use crate::error::RelayError;
use crate::models::channel::{ChannelStatus, ChannelType};
use crate::services::channel_selector::ChannelSelector;
use crate::services::notifier::Notifier;

const DISABLE_CODES: &[&str] = &["invalid_api_key", "account_deactivated", "billing_not_active"];

const DISABLE_TYPES: &[&str] = &[
    "insufficient_quota",
    "insufficient_user_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

/// 渠道禁用/启用判定规则
#[derive(Debug, Clone)]
pub struct HealthRules {
    auto_disable_enabled: bool,
    auto_enable_enabled: bool,
    /// 已转小写
    keywords: Vec<String>,
}

impl HealthRules {
    pub fn new(auto_disable_enabled: bool, auto_enable_enabled: bool, keywords: &[String]) -> Self {
        Self {
            auto_disable_enabled,
            auto_enable_enabled,
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(
            config.auto_disable_enabled,
            config.auto_enable_enabled,
            &config.disable_keywords,
        )
    }

    /// 错误是否明确表示凭证或渠道已不可用
    pub fn should_disable(&self, channel_type: ChannelType, error: &RelayError) -> bool {
        if !self.auto_disable_enabled {
            return false;
        }
        let RelayError::Upstream { status, error } = error else {
            return false;
        };

        if *status == 401 {
            return true;
        }
        if *status == 403 && channel_type == ChannelType::Gemini {
            return true;
        }
        if error
            .code
            .as_deref()
            .map_or(false, |code| DISABLE_CODES.contains(&code))
        {
            return true;
        }
        if DISABLE_TYPES.contains(&error.error_type.as_str()) {
            return true;
        }

        let message = error.message.to_lowercase();
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }

    /// 探测无错误且渠道处于自动禁用状态时才重新启用
    pub fn should_enable(&self, probe_error: Option<&RelayError>, status: ChannelStatus) -> bool {
        self.auto_enable_enabled && probe_error.is_none() && status == ChannelStatus::AutoDisabled
    }
}

/// 一次失败尝试的上报内容
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub request_id: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub auto_ban: bool,
    pub error: RelayError,
}

/// 渠道健康管理：执行禁用/启用并通知运维
pub struct ChannelHealthManager {
    rules: HealthRules,
    store: Arc<dyn ChannelStore>,
    selector: Arc<ChannelSelector>,
    notifier: Arc<dyn Notifier>,
}

impl ChannelHealthManager {
    pub fn new(
        rules: HealthRules,
        store: Arc<dyn ChannelStore>,
        selector: Arc<ChannelSelector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            rules,
            store,
            selector,
            notifier,
        }
    }

    pub fn rules(&self) -> &HealthRules {
        &self.rules
    }

    /// 处理一次失败上报
    pub async fn handle_failure(&self, report: FailureReport) {
        error!(
            "渠道请求失败 [{}]: channel_id={}, type={}, name={}, status={}, error={}",
            report.request_id,
            report.channel_id,
            report.channel_type,
            report.channel_name,
            report.error.status_code(),
            report.error
        );

        if report.auto_ban && self.rules.should_disable(report.channel_type, &report.error) {
            let reason = report.error.to_string();
            if let Err(e) = self
                .disable_channel(report.channel_id, &report.channel_name, &reason)
                .await
            {
                error!("禁用渠道 #{} 失败: {}", report.channel_id, e);
            }
        }
    }

    /// 自动禁用渠道，已是该状态时什么也不做
    pub async fn disable_channel(&self, channel_id: i64, name: &str, reason: &str) -> Result<()> {
        let changed = self
            .store
            .update_status(channel_id, ChannelStatus::AutoDisabled, Some(reason.to_string()))
            .await?;
        if !changed {
            return Ok(());
        }

        self.selector.invalidate_all();
        warn!("渠道「{}」(#{}) 已被自动禁用, 原因: {}", name, channel_id, reason);
        let content = format!("渠道「{}」（#{}）已被禁用，原因：{}", name, channel_id, reason);
        if let Err(e) = self.notifier.notify("渠道已禁用", &content).await {
            error!("发送渠道禁用通知失败: {}", e);
        }
        Ok(())
    }

    /// 重新启用渠道，已是该状态时什么也不做
    pub async fn enable_channel(&self, channel_id: i64, name: &str) -> Result<()> {
        let changed = self
            .store
            .update_status(channel_id, ChannelStatus::Enabled, None)
            .await?;
        if !changed {
            return Ok(());
        }

        self.selector.invalidate_all();
        info!("渠道「{}」(#{}) 已被重新启用", name, channel_id);
        let content = format!("渠道「{}」（#{}）已被启用", name, channel_id);
        if let Err(e) = self.notifier.notify("渠道已启用", &content).await {
            error!("发送渠道启用通知失败: {}", e);
        }
        Ok(())
    }
}

/// 失败上报入口：有界队列，满了就丢弃并记录日志，绝不阻塞请求
#[derive(Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<FailureReport>,
}

impl HealthReporter {
    pub fn new(tx: mpsc::Sender<FailureReport>) -> Self {
        Self { tx }
    }

    pub fn report(&self, report: FailureReport) {
        if let Err(e) = self.tx.try_send(report) {
            match e {
                mpsc::error::TrySendError::Full(report) => warn!(
                    "健康上报队列已满, 丢弃渠道 #{} 的失败记录",
                    report.channel_id
                ),
                mpsc::error::TrySendError::Closed(report) => warn!(
                    "健康上报队列已关闭, 丢弃渠道 #{} 的失败记录",
                    report.channel_id
                ),
            }
        }
    }
}

/// 启动健康上报的后台消费者
pub fn spawn_health_worker(
    manager: Arc<ChannelHealthManager>,
    capacity: usize,
) -> (HealthReporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            manager.handle_failure(report).await;
        }
        info!("健康上报队列已关闭, 后台任务退出");
    });
    (HealthReporter { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel_store::MockChannelStore;
    use crate::error::ApiError;
    use crate::services::notifier::MockNotifier;
    use std::time::Duration;

    fn rules() -> HealthRules {
        HealthRules::new(
            true,
            true,
            &["Your credit balance is too low".to_string()],
        )
    }

    fn upstream(status: u16, error: ApiError) -> RelayError {
        RelayError::upstream(status, error)
    }

    #[test]
    fn unauthorized_always_disables() {
        let err = upstream(401, ApiError::new("bad key", "invalid_request_error"));
        assert!(rules().should_disable(ChannelType::OpenAI, &err));
    }

    #[test]
    fn forbidden_disables_only_gemini() {
        let err = upstream(403, ApiError::new("no", "upstream_error"));
        assert!(rules().should_disable(ChannelType::Gemini, &err));
        assert!(!rules().should_disable(ChannelType::OpenAI, &err));
    }

    #[test]
    fn structured_codes_and_types_disable() {
        let by_code = upstream(
            400,
            ApiError::new("x", "invalid_request_error").with_code("account_deactivated"),
        );
        assert!(rules().should_disable(ChannelType::OpenAI, &by_code));

        let by_type = upstream(429, ApiError::new("quota", "insufficient_quota"));
        assert!(rules().should_disable(ChannelType::OpenAI, &by_type));
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let err = upstream(400, ApiError::new("YOUR CREDIT BALANCE IS TOO LOW", "x"));
        assert!(rules().should_disable(ChannelType::Anthropic, &err));
        let err = upstream(500, ApiError::new("overloaded", "server_error"));
        assert!(!rules().should_disable(ChannelType::Anthropic, &err));
    }

    #[test]
    fn local_and_disabled_switch_never_disable() {
        assert!(!rules().should_disable(ChannelType::OpenAI, &RelayError::unauthorized("bad")));
        let off = HealthRules::new(false, true, &[]);
        let err = upstream(401, ApiError::new("bad key", "x"));
        assert!(!off.should_disable(ChannelType::OpenAI, &err));
    }

    #[test]
    fn enable_only_auto_disabled_channels() {
        let rules = rules();
        assert!(rules.should_enable(None, ChannelStatus::AutoDisabled));
        assert!(!rules.should_enable(None, ChannelStatus::ManuallyDisabled));
        assert!(!rules.should_enable(Some(&RelayError::EmptyResponse), ChannelStatus::AutoDisabled));
        let off = HealthRules::new(true, false, &[]);
        assert!(!off.should_enable(None, ChannelStatus::AutoDisabled));
    }

    fn manager(store: MockChannelStore, notifier: MockNotifier) -> Arc<ChannelHealthManager> {
        let store: Arc<dyn ChannelStore> = Arc::new(store);
        let selector = Arc::new(ChannelSelector::new(store.clone(), Duration::from_secs(60)));
        Arc::new(ChannelHealthManager::new(
            rules(),
            store,
            selector,
            Arc::new(notifier),
        ))
    }

    fn report(auto_ban: bool, status: u16) -> FailureReport {
        FailureReport {
            request_id: "req".into(),
            channel_id: 5,
            channel_type: ChannelType::OpenAI,
            channel_name: "main".into(),
            auto_ban,
            error: upstream(status, ApiError::new("invalid key", "x")),
        }
    }

    #[tokio::test]
    async fn worker_disables_and_notifies_once() {
        let mut store = MockChannelStore::new();
        store
            .expect_update_status()
            .times(1)
            .returning(|_, _, _| Ok(true));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _| Ok(()));

        let (reporter, handle) = spawn_health_worker(manager(store, notifier), 8);
        reporter.report(report(true, 401));
        drop(reporter);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn auto_ban_flag_gates_disabling() {
        let mut store = MockChannelStore::new();
        store.expect_update_status().never();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        manager(store, notifier).handle_failure(report(false, 401)).await;
    }

    #[tokio::test]
    async fn repeated_disable_is_a_noop() {
        let mut store = MockChannelStore::new();
        store.expect_update_status().returning(|_, _, _| Ok(false));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        manager(store, notifier)
            .disable_channel(5, "main", "401")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_reports_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let reporter = HealthReporter { tx };
        reporter.report(report(true, 500));
        reporter.report(report(true, 500));
    }
}
