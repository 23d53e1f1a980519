//! 配置管理
//!
//! 配置按以下顺序加载，后者覆盖前者：
//! 1. 各配置段的默认值
//! 2. TOML 配置文件
//! 3. 环境变量（前缀 `TASKPILOT_`，层级分隔符 `__`，例如 `TASKPILOT_EXECUTOR__MAX_CONCURRENT_TASKS=8`）

pub mod models;

pub use models::{
    AppConfig, CallbackConfig, DatabaseConfig, ExecutorConfig, GatewayConfig,
    ObservabilityConfig, RetentionConfig, RiskConfig, StorageConfig,
};
