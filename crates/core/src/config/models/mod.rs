pub mod app_config;
pub mod database;
pub mod executor;
pub mod gateway;
pub mod observability;
pub mod risk;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use executor::{CallbackConfig, ExecutorConfig, RetentionConfig};
pub use gateway::GatewayConfig;
pub use observability::{ObservabilityConfig, StorageConfig};
pub use risk::RiskConfig;
