use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskpilot_core::{
    config::GatewayConfig,
    models::{Endpoint, EndpointConfig, EndpointStats, EndpointStatus},
    traits::StateRepository,
    SchedulerError, SchedulerResult,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::rate_limiter::EndpointRateLimiter;
use crate::strategies::Candidate;

/// 端点状态在状态存储中的命名空间
pub const ENDPOINTS_NAMESPACE: &str = "endpoints";

/// 判定为降级前所需的最少样本数
const MIN_DEGRADED_SAMPLES: usize = 5;

/// 被限流标记的有效期，与令牌桶的一分钟窗口对应
const RATE_LIMITED_WINDOW_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub degraded_success_rate: f64,
    pub stats_window: usize,
}

impl HealthSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: Duration::seconds(config.cooldown_seconds as i64),
            degraded_success_rate: config.degraded_success_rate,
            stats_window: config.stats_window,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// 端点在本次选择中的资格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eligibility {
    Primary,
    /// 冷却结束的 Failed 端点，允许一次探测
    Probe,
    /// 仅在没有 Active 端点时使用
    Fallback,
    Excluded,
}

/// 端点的实时健康状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub status: EndpointStatus,
    pub stats: EndpointStats,
    pub failed_at: Option<DateTime<Utc>>,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub override_status: Option<EndpointStatus>,
    #[serde(skip)]
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl EndpointHealth {
    /// 对外可见的状态，管理覆盖优先
    pub fn effective_status(&self, now: DateTime<Utc>) -> EndpointStatus {
        if let Some(status) = self.override_status {
            return status;
        }
        if self.status != EndpointStatus::Failed {
            if let Some(at) = self.rate_limited_at {
                if now - at < Duration::seconds(RATE_LIMITED_WINDOW_SECONDS) {
                    return EndpointStatus::RateLimited;
                }
            }
        }
        self.status
    }

    pub fn cooldown_remaining(&self, settings: &HealthSettings, now: DateTime<Utc>) -> Duration {
        match (self.status, self.failed_at) {
            (EndpointStatus::Failed, Some(at)) => (at + settings.cooldown - now).max(Duration::zero()),
            _ => Duration::zero(),
        }
    }

    pub(crate) fn eligibility(
        &self,
        settings: &HealthSettings,
        probe_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Eligibility {
        if let Some(status) = self.override_status {
            return match status {
                EndpointStatus::Active => Eligibility::Primary,
                EndpointStatus::Degraded | EndpointStatus::RateLimited => Eligibility::Fallback,
                EndpointStatus::Failed => Eligibility::Excluded,
            };
        }

        match self.effective_status(now) {
            EndpointStatus::Active => Eligibility::Primary,
            EndpointStatus::Degraded | EndpointStatus::RateLimited => Eligibility::Fallback,
            EndpointStatus::Failed => {
                let probing = self
                    .probe_started_at
                    .is_some_and(|at| now - at < probe_timeout);
                if !probing && self.cooldown_remaining(settings, now).is_zero() {
                    Eligibility::Probe
                } else {
                    Eligibility::Excluded
                }
            }
        }
    }

    /// 记录一次调用结果并重新推导状态
    pub fn record(
        &mut self,
        success: bool,
        latency_ms: u64,
        error: Option<String>,
        settings: &HealthSettings,
        now: DateTime<Utc>,
    ) {
        self.stats
            .record(success, latency_ms, error, settings.stats_window, now);
        self.probe_started_at = None;
        if success {
            self.rate_limited_at = None;
        }

        if self.stats.consecutive_failures >= settings.failure_threshold {
            // 探测失败同样重新开始冷却
            self.status = EndpointStatus::Failed;
            self.failed_at = Some(now);
        } else if self.stats.sample_count() >= MIN_DEGRADED_SAMPLES
            && self.stats.success_rate() < settings.degraded_success_rate
        {
            self.status = EndpointStatus::Degraded;
            self.failed_at = None;
        } else {
            self.status = EndpointStatus::Active;
            self.failed_at = None;
        }
    }

    pub fn reset(&mut self) {
        let override_status = self.override_status;
        *self = Self {
            override_status,
            ..Self::default()
        };
    }
}

/// 端点状态快照，用于展示与监控
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub name: String,
    pub base_url: String,
    pub model: Option<String>,
    pub priority: u32,
    pub status: EndpointStatus,
    pub override_status: Option<EndpointStatus>,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub max_requests_per_minute: u32,
    pub cooldown_remaining_seconds: i64,
}

pub(crate) struct EndpointSlot {
    pub(crate) config: EndpointConfig,
    pub(crate) endpoint: Endpoint,
    pub(crate) limiter: Option<EndpointRateLimiter>,
    health: Mutex<EndpointHealth>,
}

impl EndpointSlot {
    pub(crate) fn health(&self) -> MutexGuard<'_, EndpointHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_std(self.endpoint.timeout).unwrap_or_else(|_| Duration::seconds(30))
    }
}

/// 端点注册表
///
/// 每个端点的健康状态有独立的互斥锁，不同端点的统计更新互不阻塞。
pub struct EndpointRegistry {
    slots: RwLock<HashMap<String, Arc<EndpointSlot>>>,
    settings: HealthSettings,
    state_repository: Option<Arc<dyn StateRepository>>,
}

impl EndpointRegistry {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            settings,
            state_repository: None,
        }
    }

    /// 端点状态写入状态存储，注册同名端点时恢复
    pub fn with_state_repository(mut self, repository: Arc<dyn StateRepository>) -> Self {
        self.state_repository = Some(repository);
        self
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub async fn register(&self, config: EndpointConfig) -> SchedulerResult<Endpoint> {
        config
            .validate()
            .map_err(|e| SchedulerError::Validation(e.to_string()))?;

        let endpoint = config.to_endpoint();
        if endpoint.credential.is_none() {
            warn!("端点 {} 未配置凭证", endpoint.name);
        }

        let health = self.restore(&config.name).await.unwrap_or_default();
        let slot = Arc::new(EndpointSlot {
            limiter: EndpointRateLimiter::per_minute(config.max_requests_per_minute),
            endpoint: endpoint.clone(),
            config,
            health: Mutex::new(health),
        });

        let replaced = self
            .slots
            .write()
            .await
            .insert(endpoint.name.clone(), slot)
            .is_some();
        info!(
            "注册端点: {} (priority={}, replaced={})",
            endpoint.name, endpoint.priority, replaced
        );
        Ok(endpoint)
    }

    pub async fn remove(&self, name: &str) -> SchedulerResult<bool> {
        let removed = self.slots.write().await.remove(name).is_some();
        if removed {
            if let Some(repository) = &self.state_repository {
                repository.delete(ENDPOINTS_NAMESPACE, name).await?;
            }
            info!("移除端点: {}", name);
        }
        Ok(removed)
    }

    pub async fn get(&self, name: &str) -> Option<Endpoint> {
        self.slots
            .read()
            .await
            .get(name)
            .map(|slot| slot.endpoint.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn status(&self, name: &str) -> Option<EndpointStatus> {
        let slot = self.slot(name).await?;
        let status = slot.health().effective_status(Utc::now());
        Some(status)
    }

    pub async fn health(&self, name: &str) -> Option<EndpointHealth> {
        let slot = self.slot(name).await?;
        let health = slot.health().clone();
        Some(health)
    }

    pub(crate) async fn slot(&self, name: &str) -> Option<Arc<EndpointSlot>> {
        self.slots.read().await.get(name).cloned()
    }

    /// 按资格分层的候选端点，按 (priority, name) 排序
    pub(crate) async fn candidates(
        &self,
        exclude: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> (Vec<(Arc<EndpointSlot>, Eligibility)>, Vec<Arc<EndpointSlot>>) {
        let mut slots: Vec<Arc<EndpointSlot>> = self
            .slots
            .read()
            .await
            .values()
            .filter(|slot| !exclude.contains(&slot.endpoint.name))
            .cloned()
            .collect();
        slots.sort_by(|a, b| {
            a.endpoint
                .priority
                .cmp(&b.endpoint.priority)
                .then_with(|| a.endpoint.name.cmp(&b.endpoint.name))
        });

        let mut primary = Vec::new();
        let mut fallback = Vec::new();
        for slot in slots {
            let eligibility = slot
                .health()
                .eligibility(&self.settings, slot.probe_timeout(), now);
            match eligibility {
                Eligibility::Primary | Eligibility::Probe => primary.push((slot, eligibility)),
                Eligibility::Fallback => fallback.push(slot),
                Eligibility::Excluded => {}
            }
        }
        (primary, fallback)
    }

    pub(crate) fn candidate_view(slot: &EndpointSlot) -> Candidate {
        let health = slot.health();
        Candidate {
            name: slot.endpoint.name.clone(),
            priority: slot.endpoint.priority,
            success_rate: health.stats.success_rate(),
            avg_latency_ms: health.stats.avg_latency_ms(),
        }
    }

    /// 认领探测资格，同一时刻只允许一个探测
    pub(crate) fn claim_probe(&self, slot: &EndpointSlot, now: DateTime<Utc>) -> bool {
        let mut health = slot.health();
        if health.eligibility(&self.settings, slot.probe_timeout(), now) != Eligibility::Probe {
            return false;
        }
        health.probe_started_at = Some(now);
        debug!("端点 {} 冷却结束，进行探测调用", slot.endpoint.name);
        true
    }

    /// 归还未使用的探测资格
    pub(crate) fn release_probe(&self, slot: &EndpointSlot) {
        slot.health().probe_started_at = None;
    }

    pub(crate) fn mark_rate_limited(&self, slot: &EndpointSlot, now: DateTime<Utc>) {
        slot.health().rate_limited_at = Some(now);
        debug!("端点 {} 限流等待超时", slot.endpoint.name);
    }

    /// 记录调用结果，返回记录后的状态
    pub async fn record_outcome(
        &self,
        name: &str,
        success: bool,
        latency_ms: u64,
        error: Option<String>,
    ) -> SchedulerResult<EndpointStatus> {
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| SchedulerError::EndpointNotFound {
                name: name.to_string(),
            })?;
        let now = Utc::now();

        let (before, health) = {
            let mut health = slot.health();
            let before = health.status;
            health.record(success, latency_ms, error, &self.settings, now);
            (before, health.clone())
        };

        if before != health.status {
            match health.status {
                EndpointStatus::Failed => warn!(
                    "端点 {} 连续失败 {} 次，标记为 Failed，冷却 {} 秒",
                    name,
                    health.stats.consecutive_failures,
                    self.settings.cooldown.num_seconds()
                ),
                status => info!("端点 {} 状态变更: {} -> {}", name, before, status),
            }
        }

        self.persist(name, &health).await;
        Ok(health.effective_status(now))
    }

    /// 管理覆盖，`None` 清除覆盖
    pub async fn set_override(
        &self,
        name: &str,
        status: Option<EndpointStatus>,
    ) -> SchedulerResult<()> {
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| SchedulerError::EndpointNotFound {
                name: name.to_string(),
            })?;
        let health = {
            let mut health = slot.health();
            health.override_status = status;
            health.clone()
        };
        info!("端点 {} 管理覆盖: {:?}", name, status);
        self.persist(name, &health).await;
        Ok(())
    }

    /// 重置统计，`None` 表示全部端点
    pub async fn reset_stats(&self, name: Option<&str>) -> SchedulerResult<()> {
        let slots: Vec<Arc<EndpointSlot>> = match name {
            Some(name) => vec![self.slot(name).await.ok_or_else(|| {
                SchedulerError::EndpointNotFound {
                    name: name.to_string(),
                }
            })?],
            None => self.slots.read().await.values().cloned().collect(),
        };

        for slot in slots {
            let health = {
                let mut health = slot.health();
                health.reset();
                health.clone()
            };
            self.persist(&slot.endpoint.name, &health).await;
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let now = Utc::now();
        let mut slots: Vec<Arc<EndpointSlot>> = self.slots.read().await.values().cloned().collect();
        slots.sort_by(|a, b| a.endpoint.name.cmp(&b.endpoint.name));

        slots
            .iter()
            .map(|slot| {
                let health = slot.health();
                EndpointSnapshot {
                    name: slot.endpoint.name.clone(),
                    base_url: slot.endpoint.base_url.clone(),
                    model: slot.endpoint.model.clone(),
                    priority: slot.endpoint.priority,
                    status: health.effective_status(now),
                    override_status: health.override_status,
                    success_rate: health.stats.success_rate(),
                    avg_latency_ms: health.stats.avg_latency_ms(),
                    success_count: health.stats.success_count,
                    failure_count: health.stats.failure_count,
                    consecutive_failures: health.stats.consecutive_failures,
                    last_error: health.stats.last_error.clone(),
                    max_requests_per_minute: slot.config.max_requests_per_minute,
                    cooldown_remaining_seconds: health
                        .cooldown_remaining(&self.settings, now)
                        .num_seconds(),
                }
            })
            .collect()
    }

    async fn restore(&self, name: &str) -> Option<EndpointHealth> {
        let repository = self.state_repository.as_ref()?;
        match repository.get(ENDPOINTS_NAMESPACE, name).await {
            Ok(Some(value)) => match serde_json::from_value::<EndpointHealth>(value) {
                Ok(health) => {
                    debug!("恢复端点 {} 的状态: {}", name, health.status);
                    Some(health)
                }
                Err(e) => {
                    warn!("端点 {} 的持久化状态无法解析: {}", name, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("读取端点 {} 的持久化状态失败: {}", name, e);
                None
            }
        }
    }

    async fn persist(&self, name: &str, health: &EndpointHealth) {
        let Some(repository) = &self.state_repository else {
            return;
        };
        let value = match serde_json::to_value(health) {
            Ok(value) => value,
            Err(e) => {
                warn!("序列化端点 {} 状态失败: {}", name, e);
                return;
            }
        };
        if let Err(e) = repository.put(ENDPOINTS_NAMESPACE, name, &value).await {
            warn!("保存端点 {} 状态失败: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HealthSettings {
        HealthSettings {
            failure_threshold: 3,
            cooldown: Duration::seconds(60),
            degraded_success_rate: 0.5,
            stats_window: 10,
        }
    }

    #[test]
    fn test_consecutive_failures_demote_then_probe_restores() {
        let settings = settings();
        let probe_timeout = Duration::seconds(5);
        let start = Utc::now();
        let mut health = EndpointHealth::default();

        for _ in 0..2 {
            health.record(false, 10, Some("502".into()), &settings, start);
        }
        assert_eq!(health.status, EndpointStatus::Active);
        health.record(false, 10, Some("502".into()), &settings, start);
        assert_eq!(health.status, EndpointStatus::Failed);
        assert_eq!(
            health.eligibility(&settings, probe_timeout, start + Duration::seconds(30)),
            Eligibility::Excluded
        );

        let after = start + Duration::seconds(61);
        assert_eq!(health.eligibility(&settings, probe_timeout, after), Eligibility::Probe);
        health.probe_started_at = Some(after);
        assert_eq!(
            health.eligibility(&settings, probe_timeout, after),
            Eligibility::Excluded
        );

        health.record(true, 10, None, &settings, after);
        assert_eq!(health.status, EndpointStatus::Active);
        assert_eq!(health.stats.consecutive_failures, 0);
    }

    #[test]
    fn test_failed_probe_restarts_cooldown() {
        let settings = settings();
        let start = Utc::now();
        let mut health = EndpointHealth::default();
        for _ in 0..3 {
            health.record(false, 10, None, &settings, start);
        }
        let probe_at = start + Duration::seconds(61);
        health.record(false, 10, None, &settings, probe_at);
        assert_eq!(health.status, EndpointStatus::Failed);
        assert_eq!(health.cooldown_remaining(&settings, probe_at), Duration::seconds(60));
    }

    #[test]
    fn test_low_success_rate_degrades() {
        let settings = settings();
        let now = Utc::now();
        let mut health = EndpointHealth::default();
        for i in 0..6 {
            // 交替失败，不会触发连续失败阈值
            health.record(i % 3 == 0, 10, None, &settings, now);
        }
        assert_eq!(health.status, EndpointStatus::Degraded);
        assert_eq!(
            health.eligibility(&settings, Duration::seconds(5), now),
            Eligibility::Fallback
        );
    }

    #[test]
    fn test_override_wins_and_survives_reset() {
        let mut health = EndpointHealth {
            override_status: Some(EndpointStatus::Failed),
            ..Default::default()
        };
        let now = Utc::now();
        assert_eq!(health.effective_status(now), EndpointStatus::Failed);
        health.reset();
        assert_eq!(health.override_status, Some(EndpointStatus::Failed));
        assert_eq!(
            health.eligibility(&settings(), Duration::seconds(5), now),
            Eligibility::Excluded
        );
    }
}
