use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{AppConfig, ServerConfig};
use crate::database::{
    ChannelStore, OptionStore, SqliteChannelStore, SqliteOptionStore, SqliteTokenStore, TokenStore,
};
use crate::dto::{ChatCompletionRequest, Message, Usage};
use crate::error::{ApiError, ErrorResponse};
use crate::handlers::api::{channel, model_mapping, models, relay, AdminResponse};
use crate::models::model_mapping::{GlobalModelMapping, ModelMappingItem};
use crate::relay::AdaptorRegistry;
use crate::services::channel_test::ProbeResult;
use crate::services::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::services::{
    spawn_health_worker, ChannelHealthManager, ChannelSelector, ChannelTester, HealthRules,
    ModelMappingService, RelayService,
};

/// API文档
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::api::relay::chat_completions,
        crate::handlers::api::model_mapping::get_model_mapping,
        crate::handlers::api::model_mapping::update_model_mapping,
        crate::handlers::api::model_mapping::get_model_mapping_config,
        crate::handlers::api::model_mapping::update_model_mapping_config,
        crate::handlers::api::model_mapping::reload_model_mapping,
        crate::handlers::api::model_mapping::list_virtual_models,
        crate::handlers::api::channel::refresh_channel_cache,
        crate::handlers::api::channel::test_channel
    ),
    components(
        schemas(
            ChatCompletionRequest,
            Message,
            Usage,
            ApiError,
            ErrorResponse,
            AdminResponse,
            GlobalModelMapping,
            ModelMappingItem,
            ProbeResult
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "relay", description = "OpenAI兼容的中转接口"),
        (name = "model_mapping", description = "虚拟模型映射管理"),
        (name = "channel", description = "渠道缓存与探测")
    )
)]
struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

// 应用程序状态
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub mapper: Arc<ModelMappingService>,
    pub selector: Arc<ChannelSelector>,
    pub tester: Arc<ChannelTester>,
    pub tokens: Arc<dyn TokenStore>,
    pub admin_token: Arc<str>,
}

impl AppState {
    /// 组装全部服务，并启动健康上报的后台任务
    pub async fn build(config: &AppConfig, pool: SqlitePool) -> anyhow::Result<Self> {
        let channels: Arc<dyn ChannelStore> = Arc::new(SqliteChannelStore::new(pool.clone()));
        let tokens: Arc<dyn TokenStore> = Arc::new(SqliteTokenStore::new(pool.clone()));
        let options: Arc<dyn OptionStore> = Arc::new(SqliteOptionStore::new(pool));

        let selector = Arc::new(ChannelSelector::new(
            channels.clone(),
            Duration::from_secs(config.relay.channel_cache_ttl_secs),
        ));

        let mapper = Arc::new(ModelMappingService::new(options));
        if let Err(e) = mapper.load().await {
            // 已保存的映射不合法时不阻止启动，以空映射运行直到管理员修正
            error!("加载全局模型映射失败, 使用空映射: {}", e);
        }

        let notifier: Arc<dyn Notifier> = match config.health_check.notify_webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(url.trim())?),
            _ => Arc::new(LogNotifier),
        };
        let health = Arc::new(ChannelHealthManager::new(
            HealthRules::from_config(&config.health_check),
            channels.clone(),
            selector.clone(),
            notifier,
        ));
        // 上报队列的消费任务随进程常驻，不需要持有句柄
        let (reporter, _) = spawn_health_worker(health.clone(), config.health_check.queue_capacity);

        let registry = Arc::new(AdaptorRegistry::new(Duration::from_secs(
            config.relay.upstream_timeout_secs,
        ))?);
        let relay = Arc::new(RelayService::new(
            &config.relay,
            selector.clone(),
            mapper.clone(),
            registry.clone(),
            channels.clone(),
            reporter,
        ));
        let tester = Arc::new(ChannelTester::new(registry, channels, health));

        if config.auth.admin_token.is_empty() {
            warn!("未配置 ADMIN_TOKEN, 管理接口将拒绝所有请求");
        }
        info!(
            "中转服务初始化完成: 最大重试{}次, 自动重试={}",
            config.relay.max_retries(),
            config.relay.auto_retry.enabled
        );

        Ok(Self {
            relay,
            mapper,
            selector,
            tester,
            tokens,
            admin_token: Arc::from(config.auth.admin_token.as_str()),
        })
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略无效的CORS域名: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// 配置API路由
pub fn app_routes(state: AppState, server: &ServerConfig) -> Router {
    let relay_routes = Router::new()
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/completions", post(relay::completions))
        .route("/v1/embeddings", post(relay::embeddings))
        .route("/v1/rerank", post(relay::rerank))
        .route("/v1/images/generations", post(relay::image_generations))
        .route("/v1/audio/speech", post(relay::audio_speech))
        .route("/v1/audio/transcriptions", post(relay::audio_transcriptions))
        .route("/v1/audio/translations", post(relay::audio_translations))
        .route("/v1/messages", post(relay::claude_messages))
        .route("/v1/realtime", get(relay::realtime))
        .route("/v1/models", get(models::list_models));

    let admin_routes = Router::new()
        .route(
            "/model_mapping",
            get(model_mapping::get_model_mapping).put(model_mapping::update_model_mapping),
        )
        .route(
            "/model_mapping/config",
            get(model_mapping::get_model_mapping_config)
                .put(model_mapping::update_model_mapping_config),
        )
        .route("/model_mapping/reload", post(model_mapping::reload_model_mapping))
        .route(
            "/model_mapping/virtual_models",
            get(model_mapping::list_virtual_models),
        )
        .route("/channel/cache/refresh", post(channel::refresh_channel_cache))
        .route("/channel/test/:id", get(channel::test_channel));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(relay_routes)
        .nest("/api", admin_routes)
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                // CORS 预检响应需要默认响应体，限流层放在它外面
                .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
                .layer(cors_layer(&server.cors_allowed_origins))
                .layer(DefaultBodyLimit::disable()),
        )
}

// 简单的健康检查API
async fn health_check() -> &'static str {
    "OK"
}
