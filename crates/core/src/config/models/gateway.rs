use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::models::EndpointConfig;

pub const SELECTION_STRATEGIES: [&str; 4] = ["priority", "round_robin", "least_latency", "random"];

/// 端点网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub strategy: String,
    /// 首次尝试之外的最大重试次数
    pub max_retries: u32,
    /// 连续失败多少次后端点进入 Failed
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    /// 限流时等待令牌的最长时间
    pub max_wait_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub degraded_success_rate: f64,
    pub stats_window: usize,
    /// AI 服务商端点
    pub endpoints: Vec<EndpointConfig>,
    /// 行情数据源端点，使用独立的网关实例
    pub market_endpoints: Vec<EndpointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            strategy: "priority".to_string(),
            max_retries: 2,
            failure_threshold: 3,
            cooldown_seconds: 60,
            max_wait_ms: 2_000,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            degraded_success_rate: 0.5,
            stats_window: 20,
            endpoints: Vec::new(),
            market_endpoints: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !SELECTION_STRATEGIES.contains(&self.strategy.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的端点选择策略: {}，支持的策略: {:?}",
                self.strategy,
                SELECTION_STRATEGIES
            ));
        }

        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("失败阈值必须大于0"));
        }

        if self.cooldown_seconds == 0 {
            return Err(anyhow::anyhow!("端点冷却时间必须大于0"));
        }

        if self.stats_window == 0 {
            return Err(anyhow::anyhow!("统计窗口必须大于0"));
        }

        if !(0.0..=1.0).contains(&self.degraded_success_rate) {
            return Err(anyhow::anyhow!("降级成功率阈值必须在0.0到1.0之间"));
        }

        let mut names = HashSet::new();
        for endpoint in self.endpoints.iter().chain(&self.market_endpoints) {
            endpoint.validate()?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(anyhow::anyhow!("端点名称重复: {}", endpoint.name));
            }
        }

        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            0.1,
        )
    }
}
