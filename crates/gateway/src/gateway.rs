use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use taskpilot_core::{
    config::GatewayConfig,
    models::{Endpoint, EndpointConfig, EndpointStatus},
    traits::StateRepository,
    BackoffPolicy, SchedulerError, SchedulerResult,
};
use tracing::{debug, info, warn};

use crate::registry::{Eligibility, EndpointRegistry, EndpointSlot, EndpointSnapshot, HealthSettings};
use crate::strategies::SelectionStrategy;

/// 端点网关
///
/// 每次尝试都重新选择端点，已失败过的端点在本次调用中排在未尝试端点之后，
/// 限流的端点最多等待 `max_wait`，超时后换下一个候选。
pub struct EndpointGateway {
    registry: Arc<EndpointRegistry>,
    default_strategy: SelectionStrategy,
    max_retries: u32,
    max_wait: Duration,
    backoff: BackoffPolicy,
    cursor: AtomicUsize,
}

impl EndpointGateway {
    pub fn new(config: &GatewayConfig, registry: Arc<EndpointRegistry>) -> SchedulerResult<Self> {
        Ok(Self {
            registry,
            default_strategy: config.strategy.parse()?,
            max_retries: config.max_retries,
            max_wait: config.max_wait(),
            backoff: config.backoff(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// 按配置创建网关并注册 `endpoints` 中的全部端点
    pub async fn from_config(
        config: &GatewayConfig,
        state_repository: Option<Arc<dyn StateRepository>>,
    ) -> SchedulerResult<Self> {
        Self::with_endpoints(config, &config.endpoints, state_repository).await
    }

    /// 共用网关参数，注册指定的一组端点
    pub async fn with_endpoints(
        config: &GatewayConfig,
        endpoints: &[EndpointConfig],
        state_repository: Option<Arc<dyn StateRepository>>,
    ) -> SchedulerResult<Self> {
        let mut registry = EndpointRegistry::new(HealthSettings::from_config(config));
        if let Some(repository) = state_repository {
            registry = registry.with_state_repository(repository);
        }
        let gateway = Self::new(config, Arc::new(registry))?;
        for endpoint in endpoints {
            gateway.add_endpoint(endpoint.clone()).await?;
        }
        info!(
            "端点网关已初始化: {} 个端点，默认策略 {}",
            endpoints.len(),
            gateway.default_strategy
        );
        Ok(gateway)
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn default_strategy(&self) -> SelectionStrategy {
        self.default_strategy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn add_endpoint(&self, config: EndpointConfig) -> SchedulerResult<Endpoint> {
        self.registry.register(config).await
    }

    pub async fn remove_endpoint(&self, name: &str) -> SchedulerResult<bool> {
        self.registry.remove(name).await
    }

    pub async fn set_override(
        &self,
        name: &str,
        status: Option<EndpointStatus>,
    ) -> SchedulerResult<()> {
        self.registry.set_override(name, status).await
    }

    pub async fn reset_stats(&self, name: Option<&str>) -> SchedulerResult<()> {
        self.registry.reset_stats(name).await
    }

    pub async fn snapshot(&self) -> Vec<EndpointSnapshot> {
        self.registry.snapshot().await
    }

    /// 按策略选择一个端点，不占用限流令牌
    pub async fn select(&self, strategy: SelectionStrategy) -> SchedulerResult<Endpoint> {
        self.select_slot(strategy, &HashSet::new(), false)
            .await
            .map(|(slot, _)| slot.endpoint.clone())
            .ok_or(SchedulerError::NoEndpointAvailable)
    }

    /// 使用默认策略与重试次数调用
    pub async fn call<T, F, Fut>(&self, f: F) -> SchedulerResult<(T, Endpoint)>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        self.call_with_retry(f, self.max_retries, self.default_strategy)
            .await
    }

    /// 带重试的端点调用，共 `1 + max_retries` 次尝试
    ///
    /// 参数校验类错误直接返回，不计入端点统计，也不重试。
    pub async fn call_with_retry<T, F, Fut>(
        &self,
        f: F,
        max_retries: u32,
        strategy: SelectionStrategy,
    ) -> SchedulerResult<(T, Endpoint)>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let max_attempts = max_retries + 1;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff.delay_for(attempt - 2);
                debug!("第 {} 次尝试前退避 {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }

            let Some(slot) = self.acquire(strategy, &tried).await else {
                if attempts == 0 {
                    warn!("没有可用的端点");
                    return Err(SchedulerError::NoEndpointAvailable);
                }
                break;
            };
            attempts += 1;
            tried.insert(slot.endpoint.name.clone());

            match self.attempt(&slot, &f).await {
                Ok(value) => return Ok((value, slot.endpoint.clone())),
                Err(SchedulerError::Validation(message)) => {
                    return Err(SchedulerError::Validation(message));
                }
                Err(e) => {
                    warn!(
                        "端点 {} 调用失败 (第 {}/{} 次): {}",
                        slot.endpoint.name, attempt, max_attempts, e
                    );
                    last_error = Some(format!("{}: {}", slot.endpoint.name, e));
                }
            }
        }

        Err(SchedulerError::AllAttemptsExhausted {
            attempts,
            last_error: last_error.unwrap_or_else(|| "没有可用的端点".to_string()),
        })
    }

    /// 在指定端点上执行一次调用
    pub async fn call_endpoint<T, F, Fut>(&self, name: &str, f: F) -> SchedulerResult<T>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let slot = self
            .registry
            .slot(name)
            .await
            .ok_or_else(|| SchedulerError::EndpointNotFound {
                name: name.to_string(),
            })?;

        let now = Utc::now();
        let eligibility = slot.health().eligibility(
            self.registry.settings(),
            chrono::Duration::from_std(slot.endpoint.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            now,
        );
        let probing = match eligibility {
            Eligibility::Excluded => return Err(SchedulerError::NoEndpointAvailable),
            Eligibility::Probe if !self.registry.claim_probe(&slot, now) => {
                return Err(SchedulerError::NoEndpointAvailable);
            }
            Eligibility::Probe => true,
            _ => false,
        };

        if let Some(limiter) = &slot.limiter {
            if !limiter.acquire(self.max_wait).await {
                self.registry.mark_rate_limited(&slot, Utc::now());
                if probing {
                    self.registry.release_probe(&slot);
                }
                return Err(SchedulerError::NoEndpointAvailable);
            }
        }

        self.attempt(&slot, &f).await
    }

    async fn attempt<T, F, Fut>(&self, slot: &EndpointSlot, f: &F) -> SchedulerResult<T>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let name = slot.endpoint.name.clone();
        let started = Instant::now();
        let result = match tokio::time::timeout(slot.endpoint.timeout, f(slot.endpoint.clone()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Network(format!(
                "端点 {} 调用超时 ({:?})",
                name, slot.endpoint.timeout
            ))),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(_) => {
                self.registry
                    .record_outcome(&name, true, latency_ms, None)
                    .await?;
                "success"
            }
            Err(SchedulerError::Validation(_)) => "rejected",
            Err(e) => {
                self.registry
                    .record_outcome(&name, false, latency_ms, Some(e.to_string()))
                    .await?;
                "failure"
            }
        };

        counter!("taskpilot_gateway_attempts_total", "endpoint" => name.clone(), "outcome" => outcome)
            .increment(1);
        histogram!("taskpilot_gateway_latency_ms", "endpoint" => name).record(latency_ms as f64);
        result
    }

    /// 选择端点并获取限流令牌
    async fn acquire(
        &self,
        strategy: SelectionStrategy,
        tried: &HashSet<String>,
    ) -> Option<Arc<EndpointSlot>> {
        let mut limited: HashSet<String> = HashSet::new();
        loop {
            let mut exclude: HashSet<String> = tried.union(&limited).cloned().collect();
            let mut selected = self.select_slot(strategy, &exclude, true).await;
            if selected.is_none() && !tried.is_empty() {
                // 未尝试的端点都不可用时，允许复用已失败过的端点
                exclude = limited.clone();
                selected = self.select_slot(strategy, &exclude, true).await;
            }
            let (slot, probing) = selected?;

            match &slot.limiter {
                Some(limiter) if !limiter.acquire(self.max_wait).await => {
                    self.registry.mark_rate_limited(&slot, Utc::now());
                    if probing {
                        // 未发出调用，探测资格留给后续请求
                        self.registry.release_probe(&slot);
                    }
                    limited.insert(slot.endpoint.name.clone());
                }
                _ => return Some(slot),
            }
        }
    }

    /// 按策略挑选端点；`claim` 为真时认领冷却结束端点的探测资格，
    /// 返回值的第二项表示本次是否为探测调用
    async fn select_slot(
        &self,
        strategy: SelectionStrategy,
        exclude: &HashSet<String>,
        claim: bool,
    ) -> Option<(Arc<EndpointSlot>, bool)> {
        let mut exclude = exclude.clone();
        loop {
            let now = Utc::now();
            let (primary, fallback) = self.registry.candidates(&exclude, now).await;

            if !primary.is_empty() {
                let views: Vec<_> = primary
                    .iter()
                    .map(|(slot, _)| EndpointRegistry::candidate_view(slot))
                    .collect();
                let index = strategy.pick(&views, &self.cursor)?;
                let (slot, eligibility) = &primary[index];
                let probing = *eligibility == Eligibility::Probe;
                if probing && claim && !self.registry.claim_probe(slot, now) {
                    // 探测资格已被并发调用拿走
                    exclude.insert(slot.endpoint.name.clone());
                    continue;
                }
                return Some((slot.clone(), probing && claim));
            }

            if fallback.is_empty() {
                return None;
            }
            let views: Vec<_> = fallback
                .iter()
                .map(|slot| EndpointRegistry::candidate_view(slot))
                .collect();
            let index = strategy.pick(&views, &self.cursor)?;
            debug!("没有 Active 端点，使用降级端点 {}", fallback[index].endpoint.name);
            return Some((fallback[index].clone(), false));
        }
    }
}
