use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    database::DatabaseConfig,
    executor::{CallbackConfig, ExecutorConfig, RetentionConfig},
    gateway::GatewayConfig,
    observability::{ObservabilityConfig, StorageConfig},
    risk::RiskConfig,
};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/taskpilot.toml",
    "taskpilot.toml",
    "/etc/taskpilot/config.toml",
];

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub callback: CallbackConfig,
    pub gateway: GatewayConfig,
    pub risk: RiskConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKPILOT_, nested keys separated by `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKPILOT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.executor.validate().context("执行器配置验证失败")?;
        self.callback.validate().context("回调配置验证失败")?;
        self.gateway.validate().context("网关配置验证失败")?;
        self.risk.validate().context("风险配置验证失败")?;
        self.retention.validate().context("数据保留配置验证失败")?;
        self.storage.validate().context("存储配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CooldownPolicy;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.failure_threshold, 3);
        assert_eq!(config.callback.max_attempts, 3);
    }

    #[test]
    fn test_from_toml_with_endpoints() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "memory"

            [gateway]
            strategy = "least_latency"

            [[gateway.endpoints]]
            name = "deepseek"
            base_url = "https://api.deepseek.com/v1"
            credential_env = "DEEPSEEK_API_KEY"
            model = "deepseek-chat"
            priority = 2

            [risk]
            cooldown_policy = "escalating"
            "#,
        )
        .unwrap();

        assert!(config.database.is_in_memory());
        assert_eq!(config.gateway.endpoints.len(), 1);
        assert_eq!(config.gateway.endpoints[0].max_requests_per_minute, 60);
        assert_eq!(config.risk.cooldown_policy, CooldownPolicy::Escalating);
        assert_eq!(config.executor.max_concurrent_tasks, 4);
    }

    #[test]
    fn test_invalid_sections_are_rejected() {
        assert!(AppConfig::from_toml("[gateway]\nstrategy = \"fastest\"").is_err());
        assert!(AppConfig::from_toml("[database]\nurl = \"postgres://x\"").is_err());
        assert!(AppConfig::from_toml("[risk]\ndefault_threshold_pct = 0.001").is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[executor]\nmax_concurrent_tasks = 2\npoll_interval_ms = 250").unwrap();

        std::env::set_var("TASKPILOT_EXECUTOR__MAX_CONCURRENT_TASKS", "8");
        let config = AppConfig::load(file.path().to_str()).unwrap();
        std::env::remove_var("TASKPILOT_EXECUTOR__MAX_CONCURRENT_TASKS");

        assert_eq!(config.executor.max_concurrent_tasks, 8);
        assert_eq!(config.executor.poll_interval_ms, 250);
        assert!(AppConfig::load(Some("/nonexistent/taskpilot.toml")).is_err());
    }
}
