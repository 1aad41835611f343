use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

/// 运维通知
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, content: &str) -> Result<()>;
}

/// 只写日志的通知
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, content: &str) -> Result<()> {
        info!("[通知] {}: {}", subject, content);
        Ok(())
    }
}

/// 写日志并POST到Webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, content: &str) -> Result<()> {
        info!("[通知] {}: {}", subject, content);
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "subject": subject,
                "content": content,
                "timestamp": chrono::Utc::now().timestamp(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            error!("Webhook通知失败, 状态码: {}", response.status());
            anyhow::bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_subject_and_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"subject": "渠道已禁用", "content": "#1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        notifier.notify("渠道已禁用", "#1").await.unwrap();
    }

    #[tokio::test]
    async fn webhook_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        assert!(notifier.notify("s", "c").await.is_err());
    }
}
