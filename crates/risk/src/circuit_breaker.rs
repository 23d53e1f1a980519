use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use taskpilot_core::{
    config::RiskConfig,
    models::{CircuitBreakerState, CircuitDecision, CircuitStatus, CooldownPolicy, HaltReason},
    traits::StateRepository,
    SchedulerError, SchedulerResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CIRCUITS_NAMESPACE: &str = "circuit_breakers";

const MIN_THRESHOLD_PCT: f64 = 0.01;
const MIN_COOLDOWN_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
struct CircuitSettings {
    default_threshold_pct: f64,
    default_cooldown_seconds: i64,
    min_liquidity_score: f64,
    policy: CooldownPolicy,
    multiplier: f64,
    max_cooldown_seconds: i64,
    max_halt_reasons: usize,
}

impl CircuitSettings {
    fn cooldown_for(&self, state: &CircuitBreakerState) -> i64 {
        match self.policy {
            CooldownPolicy::Fixed => state.cooldown_seconds,
            CooldownPolicy::Escalating => {
                let exponent = state.trip_count.saturating_sub(1).min(32) as i32;
                let scaled = state.cooldown_seconds as f64 * self.multiplier.powi(exponent);
                (scaled as i64).clamp(state.cooldown_seconds, self.max_cooldown_seconds.max(state.cooldown_seconds))
            }
        }
    }
}

/// 交易对熔断器
///
/// 价格波动超过阈值或流动性过低时触发，冷却期内无论新数据如何都拒绝。
/// 冷却结束后在下一次检查时显式复位，不存在隐式的半开状态。
pub struct CircuitBreakerRegistry {
    states: Mutex<HashMap<String, CircuitBreakerState>>,
    settings: CircuitSettings,
    state_repository: Option<Arc<dyn StateRepository>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            settings: CircuitSettings {
                default_threshold_pct: config.default_threshold_pct,
                default_cooldown_seconds: config.default_cooldown_seconds,
                min_liquidity_score: config.min_liquidity_score,
                policy: config.cooldown_policy,
                multiplier: config.cooldown_multiplier,
                max_cooldown_seconds: config.max_cooldown_seconds,
                max_halt_reasons: config.max_halt_reasons.max(1),
            },
            state_repository: None,
        }
    }

    pub fn with_state_repository(mut self, repository: Arc<dyn StateRepository>) -> Self {
        self.state_repository = Some(repository);
        self
    }

    pub async fn load(&self) -> SchedulerResult<usize> {
        let Some(repository) = &self.state_repository else {
            return Ok(0);
        };
        let mut states = self.states.lock().await;
        for (symbol, value) in repository.load_namespace(CIRCUITS_NAMESPACE).await? {
            match serde_json::from_value::<CircuitBreakerState>(value) {
                Ok(state) => {
                    states.insert(symbol, state);
                }
                Err(e) => warn!("无法解析持久化的熔断器 {}: {}", symbol, e),
            }
        }
        info!("已恢复 {} 个熔断器状态", states.len());
        Ok(states.len())
    }

    /// 为交易对设置阈值与冷却时间
    pub async fn configure(
        &self,
        symbol: &str,
        threshold_pct: f64,
        cooldown_seconds: i64,
    ) -> SchedulerResult<CircuitStatus> {
        if !(threshold_pct >= MIN_THRESHOLD_PCT) {
            return Err(SchedulerError::Validation(format!(
                "熔断阈值不能小于 {MIN_THRESHOLD_PCT}: {threshold_pct}"
            )));
        }
        if cooldown_seconds < MIN_COOLDOWN_SECONDS {
            return Err(SchedulerError::Validation(format!(
                "熔断冷却时间不能小于 {MIN_COOLDOWN_SECONDS} 秒: {cooldown_seconds}"
            )));
        }

        let mut states = self.states.lock().await;
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| self.new_state(symbol));
        state.threshold_pct = threshold_pct;
        state.cooldown_seconds = cooldown_seconds;
        if state.tripped_at.is_none() {
            state.current_cooldown_seconds = cooldown_seconds;
        }
        let state = state.clone();
        self.persist(&state).await?;
        info!(
            "熔断器 {} 已配置: 阈值 {:.2}%，冷却 {} 秒",
            symbol,
            threshold_pct * 100.0,
            cooldown_seconds
        );
        Ok(state.status(Utc::now()))
    }

    pub async fn check_circuit(
        &self,
        symbol: &str,
        move_pct: f64,
        liquidity_score: f64,
    ) -> SchedulerResult<CircuitDecision> {
        self.check_circuit_at(symbol, move_pct, liquidity_score, Utc::now())
            .await
    }

    /// 检查并在越界时触发熔断
    pub async fn check_circuit_at(
        &self,
        symbol: &str,
        move_pct: f64,
        liquidity_score: f64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CircuitDecision> {
        let mut states = self.states.lock().await;

        if let Some(state) = states.get_mut(symbol) {
            if state.is_open(now) {
                let remaining_seconds = state.remaining_cooldown_seconds(now);
                debug!("熔断器 {} 冷却中，剩余 {} 秒", symbol, remaining_seconds);
                return Ok(CircuitDecision::Block {
                    remaining_seconds,
                    reason: state.last_reason().unwrap_or("冷却中").to_string(),
                });
            }
            if state.tripped_at.take().is_some() {
                info!("熔断器 {} 冷却结束，已复位", symbol);
                let state = state.clone();
                self.persist(&state).await?;
            }
        }

        let threshold_pct = states
            .get(symbol)
            .map_or(self.settings.default_threshold_pct, |s| s.threshold_pct);
        let reason = if !move_pct.is_finite() || move_pct.abs() >= threshold_pct {
            Some(format!(
                "价格波动 {:.2}% 超过阈值 {:.2}%",
                move_pct * 100.0,
                threshold_pct * 100.0
            ))
        } else if liquidity_score < self.settings.min_liquidity_score {
            Some(format!(
                "流动性评分 {:.2} 低于 {:.2}",
                liquidity_score, self.settings.min_liquidity_score
            ))
        } else {
            None
        };

        let Some(reason) = reason else {
            return Ok(CircuitDecision::Allow);
        };

        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| self.new_state(symbol));
        state.trip_count += 1;
        state.tripped_at = Some(now);
        state.current_cooldown_seconds = self.settings.cooldown_for(state);
        state.halt_reasons.push(HaltReason {
            at: now,
            reason: reason.clone(),
        });
        let overflow = state
            .halt_reasons
            .len()
            .saturating_sub(self.settings.max_halt_reasons);
        state.halt_reasons.drain(..overflow);

        let state = state.clone();
        warn!(
            "熔断器 {} 触发 (第 {} 次): {}，冷却 {} 秒",
            symbol, state.trip_count, reason, state.current_cooldown_seconds
        );
        counter!("taskpilot_circuit_trips_total", "symbol" => symbol.to_string()).increment(1);
        self.persist(&state).await?;

        Ok(CircuitDecision::Block {
            remaining_seconds: state.current_cooldown_seconds,
            reason,
        })
    }

    pub async fn status(&self, symbol: &str) -> CircuitStatus {
        self.status_at(symbol, Utc::now()).await
    }

    pub async fn status_at(&self, symbol: &str, now: DateTime<Utc>) -> CircuitStatus {
        let states = self.states.lock().await;
        match states.get(symbol) {
            Some(state) => state.status(now),
            None => self.new_state(symbol).status(now),
        }
    }

    pub async fn all_status(&self) -> Vec<CircuitStatus> {
        let now = Utc::now();
        let states = self.states.lock().await;
        let mut statuses: Vec<CircuitStatus> =
            states.values().map(|state| state.status(now)).collect();
        statuses.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        statuses
    }

    /// 人工复位：清除触发状态与升级后的冷却时间
    pub async fn reset(&self, symbol: &str) -> SchedulerResult<CircuitStatus> {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(symbol) else {
            return Ok(self.new_state(symbol).status(Utc::now()));
        };
        state.tripped_at = None;
        state.trip_count = 0;
        state.current_cooldown_seconds = state.cooldown_seconds;
        let state = state.clone();
        self.persist(&state).await?;
        info!("熔断器 {} 已人工复位", symbol);
        Ok(state.status(Utc::now()))
    }

    fn new_state(&self, symbol: &str) -> CircuitBreakerState {
        CircuitBreakerState::new(
            symbol,
            self.settings.default_threshold_pct,
            self.settings.default_cooldown_seconds,
        )
    }

    async fn persist(&self, state: &CircuitBreakerState) -> SchedulerResult<()> {
        if let Some(repository) = &self.state_repository {
            repository
                .put(CIRCUITS_NAMESPACE, &state.symbol, &serde_json::to_value(state)?)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry(policy: CooldownPolicy) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(&RiskConfig {
            cooldown_policy: policy,
            default_cooldown_seconds: 600,
            max_cooldown_seconds: 2_000,
            ..RiskConfig::default()
        })
    }

    #[tokio::test]
    async fn test_breach_blocks_for_whole_cooldown() {
        let registry = registry(CooldownPolicy::Fixed);
        let now = Utc::now();

        let decision = registry
            .check_circuit_at("BTC/USDT", 0.06, 1.0, now)
            .await
            .unwrap();
        assert!(decision.is_blocked());

        let later = now + Duration::seconds(1);
        let decision = registry
            .check_circuit_at("BTC/USDT", 0.01, 1.0, later)
            .await
            .unwrap();
        match decision {
            CircuitDecision::Block {
                remaining_seconds, ..
            } => assert_eq!(remaining_seconds, 599),
            CircuitDecision::Allow => panic!("breaker should still be open"),
        }

        let status = registry.status_at("BTC/USDT", later).await;
        assert!(status.open);
        assert_eq!(status.trip_count, 1);
    }

    #[tokio::test]
    async fn test_cooldown_expiry_resets_explicitly() {
        let registry = registry(CooldownPolicy::Fixed);
        let now = Utc::now();
        registry
            .check_circuit_at("ETH/USDT", -0.08, 1.0, now)
            .await
            .unwrap();

        let after = now + Duration::seconds(601);
        let decision = registry
            .check_circuit_at("ETH/USDT", 0.01, 1.0, after)
            .await
            .unwrap();
        assert_eq!(decision, CircuitDecision::Allow);
        assert!(!registry.status_at("ETH/USDT", after).await.open);
    }

    #[tokio::test]
    async fn test_low_liquidity_trips() {
        let registry = registry(CooldownPolicy::Fixed);
        let decision = registry.check_circuit("SOL/USDT", 0.0, 0.1).await.unwrap();
        assert!(decision.is_blocked());
        assert!(registry
            .status("SOL/USDT")
            .await
            .last_reason
            .unwrap()
            .contains("流动性"));
    }

    #[tokio::test]
    async fn test_escalating_cooldown_is_capped() {
        let registry = registry(CooldownPolicy::Escalating);
        let mut now = Utc::now();
        let mut cooldowns = Vec::new();
        for _ in 0..4 {
            registry
                .check_circuit_at("BTC/USDT", 0.1, 1.0, now)
                .await
                .unwrap();
            let status = registry.status_at("BTC/USDT", now).await;
            cooldowns.push(status.cooldown_seconds);
            now += Duration::seconds(status.cooldown_seconds + 1);
        }
        assert_eq!(cooldowns, vec![600, 1200, 2000, 2000]);

        let status = registry.reset("BTC/USDT").await.unwrap();
        assert_eq!(status.trip_count, 0);
        assert_eq!(status.cooldown_seconds, 600);
    }

    #[tokio::test]
    async fn test_configure_validates_bounds() {
        let registry = registry(CooldownPolicy::Fixed);
        assert!(registry.configure("BTC/USDT", 0.001, 600).await.is_err());
        assert!(registry.configure("BTC/USDT", 0.05, 30).await.is_err());

        let status = registry.configure("BTC/USDT", 0.1, 120).await.unwrap();
        assert_eq!(status.threshold_pct, 0.1);
        assert!(!registry
            .check_circuit("BTC/USDT", 0.06, 1.0)
            .await
            .unwrap()
            .is_blocked());
        assert_eq!(registry.all_status().await.len(), 1);
    }
}
