use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// 默认的自动禁用关键词（上游返回这些信息基本意味着凭证已失效）
pub const DEFAULT_DISABLE_KEYWORDS: &[&str] = &[
    "Your credit balance is too low",
    "This organization has been disabled.",
    "You exceeded your current quota",
    "Permission denied",
    "The security token included in the request is invalid",
    "Operation not allowed",
    "Your account is not authorized",
];

/// 应用程序配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 环境模式
    pub environment: Environment,
    /// 服务器地址和端口
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 认证配置
    pub auth: AuthConfig,
    /// 中转与重试配置
    pub relay: RelayConfig,
    /// 渠道健康配置
    pub health_check: HealthCheckConfig,
}

/// 环境模式
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Production,
    Testing,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "testing" => Ok(Environment::Testing),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器主机地址
    pub host: String,
    /// 服务器端口
    pub port: u16,
    /// 日志级别
    pub log_level: String,
    /// 日志输出格式（text/json）
    pub log_format: String,
    /// CORS允许的域名
    pub cors_allowed_origins: Vec<String>,
    /// 请求体大小上限(字节)
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            cors_allowed_origins: vec!["*".to_string()],
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

/// 数据库配置 - SQLite版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库URL (sqlite:///path/to/db.sqlite3)
    pub url: String,
    /// 数据库文件路径
    pub path: PathBuf,
    /// 是否启用WAL模式
    pub enable_wal: bool,
    /// 是否启用外键约束
    pub enable_foreign_keys: bool,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://gateway.sqlite3?mode=rwc".to_string(),
            path: PathBuf::from("gateway.sqlite3"),
            enable_wal: true,
            enable_foreign_keys: true,
            max_connections: 5,
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// 管理接口的Bearer令牌，为空时管理接口全部拒绝
    pub admin_token: String,
}

/// 自动重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRetryConfig {
    /// 是否启用自动重试
    pub enabled: bool,
    /// 启用时的最大重试次数
    pub count: u32,
    /// 每次重试强制切换到不同的选择序号
    pub force_channel_switch: bool,
    /// 允许重试的状态码（精确码或 5xx 这样的类别），为空表示全部允许
    pub status_codes: Vec<String>,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 3,
            force_channel_switch: false,
            status_codes: vec!["5xx".to_string(), "4xx".to_string()],
        }
    }
}

/// 中转配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 未启用自动重试时的重试次数
    pub retry_times: u32,
    pub auto_retry: AutoRetryConfig,
    /// 渠道选择缓存有效期(秒)
    pub channel_cache_ttl_secs: u64,
    /// 上游请求超时(秒)
    pub upstream_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: 0,
            auto_retry: AutoRetryConfig::default(),
            channel_cache_ttl_secs: 60,
            upstream_timeout_secs: 300,
        }
    }
}

impl RelayConfig {
    /// 实际生效的最大重试次数
    pub fn max_retries(&self) -> u32 {
        if self.auto_retry.enabled {
            self.auto_retry.count
        } else {
            self.retry_times
        }
    }
}

/// 渠道健康配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// 失败时是否允许自动禁用渠道
    pub auto_disable_enabled: bool,
    /// 探测成功时是否自动启用被自动禁用的渠道
    pub auto_enable_enabled: bool,
    /// 自动禁用关键词（大小写不敏感）
    pub disable_keywords: Vec<String>,
    /// 健康上报队列容量
    pub queue_capacity: usize,
    /// 定期探测间隔(秒)，0 表示关闭
    pub interval: u64,
    /// 运维通知Webhook
    pub notify_webhook_url: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            auto_disable_enabled: true,
            auto_enable_enabled: true,
            disable_keywords: DEFAULT_DISABLE_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            queue_capacity: 1024,
            interval: 0,
            notify_webhook_url: None,
        }
    }
}

/// 读取并解析环境变量，未设置时使用默认值，格式错误时报错
fn env_or<T>(key: &str, default: T) -> Result<T, config::ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| {
            config::ConfigError::Message(format!("invalid value for {}: {} ({})", key, raw, e))
        }),
        _ => Ok(default),
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // 加载.env文件
        dotenv::dotenv().ok();

        let defaults = AppConfig::default();

        // 解析环境
        let environment = env::var("APP_ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .parse::<Environment>()
            .unwrap_or(Environment::Development);

        // 服务器配置
        let server = ServerConfig {
            host: env::var("APP_HOST").unwrap_or(defaults.server.host),
            port: env_or("APP_PORT", defaults.server.port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.server.log_level),
            log_format: env::var("LOG_FORMAT").unwrap_or(defaults.server.log_format),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|raw| split_list(&raw, ','))
                .unwrap_or(defaults.server.cors_allowed_origins),
            max_body_bytes: env_or("MAX_REQUEST_BODY_MB", 32usize)? * 1024 * 1024,
        };

        // SQLite数据库配置
        let db_path = env::var("SQLITE_PATH").unwrap_or_else(|_| "gateway.sqlite3".to_string());
        let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}?mode=rwc", db_path)
        });
        let database = DatabaseConfig {
            url: db_url,
            path: PathBuf::from(db_path),
            enable_wal: env_or("SQLITE_ENABLE_WAL", true)?,
            enable_foreign_keys: env_or("SQLITE_ENABLE_FOREIGN_KEYS", true)?,
            max_connections: env_or("SQLITE_MAX_CONNECTIONS", 5u32)?,
        };

        // 认证配置
        let auth = AuthConfig {
            admin_token: env::var("ADMIN_TOKEN").unwrap_or_default(),
        };

        // 中转配置
        let relay = RelayConfig {
            retry_times: env_or("RETRY_TIMES", defaults.relay.retry_times)?,
            auto_retry: AutoRetryConfig {
                enabled: env_or("AUTO_RETRY_ENABLED", false)?,
                count: env_or("AUTO_RETRY_COUNT", 3u32)?,
                force_channel_switch: env_or("AUTO_RETRY_FORCE_CHANNEL_SWITCH", false)?,
                status_codes: env::var("AUTO_RETRY_STATUS_CODES")
                    .map(|raw| split_list(&raw, ','))
                    .unwrap_or(defaults.relay.auto_retry.status_codes),
            },
            channel_cache_ttl_secs: env_or("CHANNEL_CACHE_TTL_SECS", 60u64)?,
            upstream_timeout_secs: env_or("UPSTREAM_TIMEOUT_SECS", 300u64)?,
        };

        // 渠道健康配置
        let health_check = HealthCheckConfig {
            auto_disable_enabled: env_or("AUTOMATIC_DISABLE_CHANNEL_ENABLED", true)?,
            auto_enable_enabled: env_or("AUTOMATIC_ENABLE_CHANNEL_ENABLED", true)?,
            disable_keywords: env::var("AUTOMATIC_DISABLE_KEYWORDS")
                .map(|raw| split_list(&raw, '|'))
                .unwrap_or(defaults.health_check.disable_keywords),
            queue_capacity: env_or("HEALTH_QUEUE_CAPACITY", 1024usize)?,
            interval: env_or("CHANNEL_TEST_INTERVAL_SECS", 0u64)?,
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
        };

        Ok(Self {
            environment,
            server,
            database,
            auth,
            relay,
            health_check,
        })
    }

    /// 获取Socket地址
    pub fn socket_addr(&self) -> Result<SocketAddr, config::ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| config::ConfigError::Message(format!("invalid listen address: {}", e)))
    }

}
