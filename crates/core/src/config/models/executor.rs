use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// 执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub poll_interval_ms: u64,
    pub max_concurrent_tasks: usize,
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub max_allowed_retries: u32,
    pub retry_base_seconds: u64,
    pub retry_max_seconds: u64,
    pub retry_jitter_factor: f64,
    /// 启动时必须有处理器覆盖的任务类型
    pub required_task_types: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_concurrent_tasks: 4,
            default_timeout_seconds: 300,
            max_timeout_seconds: 86_400,
            default_max_retries: 3,
            max_allowed_retries: 10,
            retry_base_seconds: 5,
            retry_max_seconds: 600,
            retry_jitter_factor: 0.1,
            required_task_types: vec![
                "market_analysis".to_string(),
                "ai_call".to_string(),
                "report_generation".to_string(),
                "storage_save".to_string(),
                "trade_execution".to_string(),
            ],
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.default_timeout_seconds == 0
            || self.default_timeout_seconds > self.max_timeout_seconds
        {
            return Err(anyhow::anyhow!("默认超时时间必须在 1..={} 秒之间", self.max_timeout_seconds));
        }

        if self.default_max_retries > self.max_allowed_retries {
            return Err(anyhow::anyhow!("默认重试次数不能超过最大允许重试次数"));
        }

        if self.retry_base_seconds == 0 || self.retry_base_seconds > self.retry_max_seconds {
            return Err(anyhow::anyhow!("重试间隔配置无效"));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(anyhow::anyhow!("重试抖动系数必须在0.0到1.0之间"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.retry_base_seconds),
            Duration::from_secs(self.retry_max_seconds),
            self.retry_jitter_factor,
        )
    }
}

/// 回调投递配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
    pub request_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 5_000,
            jitter_factor: 0.2,
            request_timeout_seconds: 10,
            poll_interval_ms: 1000,
            batch_size: 20,
        }
    }
}

impl CallbackConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("回调最大尝试次数必须大于0"));
        }

        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("回调请求超时时间必须大于0"));
        }

        if self.batch_size == 0 || self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("回调轮询配置无效"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("回调抖动系数必须在0.0到1.0之间"));
        }

        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.jitter_factor,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// 终态任务保留与清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub terminal_retention_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
            terminal_retention_hours: 168,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if self.terminal_retention_hours <= 0 {
            return Err(anyhow::anyhow!("终态任务保留时间必须大于0"));
        }
        Ok(())
    }
}
