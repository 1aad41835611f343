pub mod channel_health;
pub mod channel_selector;
pub mod channel_test;
pub mod model_mapper;
pub mod notifier;
pub mod relay;
pub mod retry_policy;
pub mod ttl_cache;

pub use channel_health::{spawn_health_worker, ChannelHealthManager, HealthReporter, HealthRules};
pub use channel_selector::ChannelSelector;
pub use channel_test::{spawn_periodic_probe, ChannelTester, ProbeResult};
pub use model_mapper::ModelMappingService;
pub use relay::RelayService;
pub use retry_policy::RetryPolicy;
