use serde::{Deserialize, Serialize};

use crate::models::{CooldownPolicy, RiskPeriod};

/// 风险预算与熔断配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub daily_limit: f64,
    pub weekly_limit: f64,
    pub monthly_limit: f64,
    pub default_threshold_pct: f64,
    pub default_cooldown_seconds: i64,
    /// 流动性评分低于该值时直接触发熔断
    pub min_liquidity_score: f64,
    pub cooldown_policy: CooldownPolicy,
    pub cooldown_multiplier: f64,
    pub max_cooldown_seconds: i64,
    pub max_halt_reasons: usize,
    pub max_events: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_limit: 500.0,
            weekly_limit: 2_000.0,
            monthly_limit: 8_000.0,
            default_threshold_pct: 0.05,
            default_cooldown_seconds: 1_800,
            min_liquidity_score: 0.3,
            cooldown_policy: CooldownPolicy::Fixed,
            cooldown_multiplier: 2.0,
            max_cooldown_seconds: 14_400,
            max_halt_reasons: 20,
            max_events: 200,
        }
    }
}

impl RiskConfig {
    pub fn limit_for(&self, period: RiskPeriod) -> f64 {
        match period {
            RiskPeriod::Daily => self.daily_limit,
            RiskPeriod::Weekly => self.weekly_limit,
            RiskPeriod::Monthly => self.monthly_limit,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for period in RiskPeriod::ALL {
            if self.limit_for(period) < 0.0 {
                return Err(anyhow::anyhow!("{} 预算上限不能为负数", period));
            }
        }

        if self.default_threshold_pct < 0.01 {
            return Err(anyhow::anyhow!("熔断阈值不能小于0.01"));
        }

        if self.default_cooldown_seconds < 60 {
            return Err(anyhow::anyhow!("熔断冷却时间不能小于60秒"));
        }

        if self.cooldown_multiplier < 1.0 {
            return Err(anyhow::anyhow!("冷却倍数不能小于1.0"));
        }

        if self.max_cooldown_seconds < self.default_cooldown_seconds {
            return Err(anyhow::anyhow!("最大冷却时间不能小于默认冷却时间"));
        }

        if self.max_events == 0 || self.max_halt_reasons == 0 {
            return Err(anyhow::anyhow!("事件日志容量必须大于0"));
        }

        Ok(())
    }
}
