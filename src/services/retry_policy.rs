use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::models::channel::ChannelType;

/// 对 400 也重试的渠道类型（这些上游会对偶发错误返回 400）
const BAD_REQUEST_RETRY_PROVIDERS: &[ChannelType] = &[ChannelType::Anthropic];

/// 自动重试允许的状态码规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPattern {
    Exact(u16),
    /// `5xx` 这样的类别，保存百位数字
    Class(u16),
}

impl StatusPattern {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.len() == 3 && raw.ends_with("xx") {
            let class = raw[..1].parse::<u16>().ok()?;
            return (1..=5).contains(&class).then_some(StatusPattern::Class(class));
        }
        raw.parse::<u16>().ok().map(StatusPattern::Exact)
    }

    pub fn matches(self, status: u16) -> bool {
        match self {
            StatusPattern::Exact(code) => code == status,
            StatusPattern::Class(class) => status / 100 == class,
        }
    }
}

/// 失败后是否换渠道重试
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    auto_retry_enabled: bool,
    allowed: Vec<StatusPattern>,
}

impl RetryPolicy {
    pub fn new(auto_retry_enabled: bool, status_codes: &[String]) -> Self {
        Self {
            auto_retry_enabled,
            allowed: status_codes
                .iter()
                .filter_map(|raw| StatusPattern::parse(raw))
                .collect(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.auto_retry.enabled, &config.auto_retry.status_codes)
    }

    pub fn auto_retry_enabled(&self) -> bool {
        self.auto_retry_enabled
    }

    /// 自动重试的白名单只收紧、不放宽；列表为空时全部放行
    fn allowed(&self, status: u16) -> bool {
        if !self.auto_retry_enabled || self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|p| p.matches(status))
    }

    /// 按优先顺序判断：固定渠道、429/307、5xx、400、408、2xx、空响应、其余
    pub fn should_retry(
        &self,
        error: &RelayError,
        channel_type: ChannelType,
        pinned: bool,
        remaining: u32,
    ) -> bool {
        if remaining == 0 || pinned {
            return false;
        }
        match error {
            RelayError::Local { .. } | RelayError::NotImplemented(_) => return false,
            RelayError::NoChannel { .. } => return false,
            RelayError::EmptyResponse => {
                return self.auto_retry_enabled && self.allowed(error.status_code());
            }
            RelayError::Transport(_) | RelayError::Upstream { .. } => {}
        }

        let status = error.status_code();
        if status == 429 || status == 307 {
            return true;
        }
        if (500..600).contains(&status) {
            if status == 504 || status == 524 {
                return false;
            }
            return self.allowed(status);
        }
        match status {
            // 401 走禁用渠道的路径，不重试
            401 => false,
            400 => BAD_REQUEST_RETRY_PROVIDERS.contains(&channel_type) && self.allowed(status),
            408 => false,
            200..=299 => false,
            _ => self.allowed(status),
        }
    }
}
