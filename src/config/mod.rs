pub mod app;

pub use app::AppConfig;
pub use app::Environment;
pub use app::DatabaseConfig;
pub use app::ServerConfig;
pub use app::AuthConfig;
pub use app::AutoRetryConfig;
pub use app::RelayConfig;
pub use app::HealthCheckConfig;
