use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 端点注册信息（来自配置文件或管理工具）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub credential: Option<String>,
    /// 从环境变量读取凭证
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_priority() -> u32 {
    1
}

fn default_max_requests_per_minute() -> u32 {
    60
}

fn default_timeout_seconds() -> u64 {
    30
}

impl EndpointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow::anyhow!("端点名称不能为空"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "端点 {} 的base_url必须是http(s)地址",
                self.name
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("端点 {} 的超时时间必须大于0", self.name));
        }
        Ok(())
    }

    pub fn resolve_credential(&self) -> Option<String> {
        self.credential.clone().or_else(|| {
            self.credential_env
                .as_ref()
                .and_then(|key| std::env::var(key).ok())
                .filter(|value| !value.is_empty())
        })
    }

    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint {
            name: self.name.clone(),
            base_url: self.base_url.trim_end_matches('/').to_string(),
            credential: self.resolve_credential(),
            model: self.model.clone(),
            priority: self.priority,
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// 网关交给调用方的已解析端点
#[derive(Clone, PartialEq)]
pub struct Endpoint {
    pub name: String,
    pub base_url: String,
    pub credential: Option<String>,
    pub model: Option<String>,
    pub priority: u32,
    pub timeout: Duration,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    #[default]
    Active,
    Degraded,
    Failed,
    RateLimited,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointStatus::Active => "active",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Failed => "failed",
            EndpointStatus::RateLimited => "rate_limited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSample {
    pub success: bool,
    pub latency_ms: u64,
}

/// 端点滚动统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub recent: VecDeque<CallSample>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl EndpointStats {
    pub fn record(
        &mut self,
        success: bool,
        latency_ms: u64,
        error: Option<String>,
        window: usize,
        now: DateTime<Utc>,
    ) {
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
            self.last_success_at = Some(now);
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
            self.last_failure_at = Some(now);
            self.last_error = error;
        }

        self.recent.push_back(CallSample {
            success,
            latency_ms,
        });
        while self.recent.len() > window.max(1) {
            self.recent.pop_front();
        }
    }

    /// 最近窗口内的成功率，无调用时视为 1.0
    pub fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let successes = self.recent.iter().filter(|s| s.success).count();
        successes as f64 / self.recent.len() as f64
    }

    /// 最近窗口内成功调用的平均延迟
    pub fn avg_latency_ms(&self) -> Option<f64> {
        let (sum, count) = self
            .recent
            .iter()
            .filter(|s| s.success)
            .fold((0u64, 0u64), |(sum, count), s| (sum + s.latency_ms, count + 1));
        (count > 0).then(|| sum as f64 / count as f64)
    }

    pub fn sample_count(&self) -> usize {
        self.recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drives_success_rate_and_latency() {
        let mut stats = EndpointStats::default();
        let now = Utc::now();
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(stats.avg_latency_ms(), None);

        stats.record(true, 100, None, 3, now);
        stats.record(false, 900, Some("502".into()), 3, now);
        stats.record(true, 300, None, 3, now);
        stats.record(true, 200, None, 3, now);

        assert_eq!(stats.sample_count(), 3);
        assert_eq!(stats.success_rate(), 2.0 / 3.0);
        assert_eq!(stats.avg_latency_ms(), Some(250.0));
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_error.as_deref(), Some("502"));
    }

    #[test]
    fn test_endpoint_debug_redacts_credential() {
        let config = EndpointConfig {
            name: "openai".into(),
            base_url: "https://api.openai.com/v1/".into(),
            credential: Some("sk-secret".into()),
            credential_env: None,
            model: Some("gpt-4o-mini".into()),
            priority: 1,
            max_requests_per_minute: 60,
            timeout_seconds: 30,
        };
        let endpoint = config.to_endpoint();
        assert_eq!(endpoint.base_url, "https://api.openai.com/v1");
        assert!(!format!("{endpoint:?}").contains("sk-secret"));
    }
}
