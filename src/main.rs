use std::sync::Arc;

use relay_gateway::{
    config::AppConfig,
    database::initialize_database,
    routes::{app_routes, AppState},
    services::spawn_periodic_probe,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    let config = AppConfig::from_env()?;

    // 初始化日志，RUST_LOG 优先于配置的日志级别
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    if config.server.log_format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("应用启动中...");
    info!("环境: {:?}", config.environment);

    // 初始化数据库
    let db_pool = initialize_database(&config.database).await?;
    info!("数据库初始化完成: {}", config.database.path.display());

    let state = AppState::build(&config, db_pool).await?;

    // 启动定期渠道探测
    if spawn_periodic_probe(Arc::clone(&state.tester), config.health_check.interval).is_some() {
        info!("定期渠道探测已启动, 间隔{}秒", config.health_check.interval);
    }

    // 创建路由
    let app = app_routes(state, &config.server);

    // 启动服务器
    let addr = config.socket_addr()?;
    info!("Starting server on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(&addr).await?, app.into_make_service()).await?;

    Ok(())
}
