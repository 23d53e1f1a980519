use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FailureKind, TaskFailure};
use crate::SchedulerError;

/// 风险预算周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl RiskPeriod {
    pub const ALL: [RiskPeriod; 3] = [RiskPeriod::Daily, RiskPeriod::Weekly, RiskPeriod::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskPeriod::Daily => "daily",
            RiskPeriod::Weekly => "weekly",
            RiskPeriod::Monthly => "monthly",
        }
    }

    /// 周期标识：日为当天，周为当周周一，月为当月1号
    pub fn period_key(self, now: DateTime<Utc>) -> String {
        let today = now.date_naive();
        match self {
            RiskPeriod::Daily => today.format("%Y-%m-%d").to_string(),
            RiskPeriod::Weekly => {
                let monday =
                    today - Duration::days(today.weekday().num_days_from_monday() as i64);
                monday.format("%Y-%m-%d").to_string()
            }
            RiskPeriod::Monthly => today.format("%Y-%m-01").to_string(),
        }
    }
}

impl fmt::Display for RiskPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskPeriod {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(RiskPeriod::Daily),
            "weekly" => Ok(RiskPeriod::Weekly),
            "monthly" => Ok(RiskPeriod::Monthly),
            other => Err(SchedulerError::Validation(format!("无效的预算周期: {other}"))),
        }
    }
}

/// 单个周期的风险预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBudget {
    pub period: RiskPeriod,
    pub limit: f64,
    pub consumed: f64,
    pub frozen: bool,
    pub freeze_reason: Option<String>,
    pub period_key: String,
    pub updated_at: DateTime<Utc>,
}

impl RiskBudget {
    pub fn new(period: RiskPeriod, limit: f64, now: DateTime<Utc>) -> Self {
        Self {
            period,
            limit,
            consumed: 0.0,
            frozen: false,
            freeze_reason: None,
            period_key: period.period_key(now),
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.consumed).max(0.0)
    }

    pub fn utilization_pct(&self) -> f64 {
        if self.limit > 0.0 {
            self.consumed / self.limit * 100.0
        } else {
            0.0
        }
    }

    /// 进入新周期时清零并解冻，返回是否发生了重置
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let key = self.period.period_key(now);
        if key == self.period_key {
            return false;
        }
        self.period_key = key;
        self.reset(now);
        true
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.consumed = 0.0;
        self.frozen = false;
        self.freeze_reason = None;
        self.updated_at = now;
    }

    /// 记录亏损，返回本次是否触发冻结
    pub fn add_loss(&mut self, amount: f64, now: DateTime<Utc>) -> bool {
        self.consumed += amount.abs();
        self.updated_at = now;
        if !self.frozen && self.limit > 0.0 && self.consumed > self.limit {
            self.frozen = true;
            self.freeze_reason = Some(format!(
                "{} 预算超限: 已用 {:.2} / 上限 {:.2}",
                self.period, self.consumed, self.limit
            ));
            return true;
        }
        false
    }

    pub fn decision(&self) -> BudgetDecision {
        if self.frozen {
            BudgetDecision::Frozen {
                reason: self
                    .freeze_reason
                    .clone()
                    .unwrap_or_else(|| format!("{} 预算已冻结", self.period)),
            }
        } else {
            BudgetDecision::Ok {
                remaining: self.remaining(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BudgetDecision {
    Ok { remaining: f64 },
    Frozen { reason: String },
}

impl BudgetDecision {
    pub fn is_frozen(&self) -> bool {
        matches!(self, BudgetDecision::Frozen { .. })
    }
}

/// 亏损事件日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossEvent {
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub periods: Vec<RiskPeriod>,
    pub tag: Option<String>,
    pub note: Option<String>,
}

/// 熔断冷却策略：重复触发时是否延长冷却
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownPolicy {
    #[default]
    Fixed,
    Escalating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReason {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// 单个交易对的熔断器状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub symbol: String,
    pub threshold_pct: f64,
    pub cooldown_seconds: i64,
    pub current_cooldown_seconds: i64,
    pub tripped_at: Option<DateTime<Utc>>,
    pub trip_count: u32,
    pub halt_reasons: Vec<HaltReason>,
}

impl CircuitBreakerState {
    pub fn new(symbol: impl Into<String>, threshold_pct: f64, cooldown_seconds: i64) -> Self {
        Self {
            symbol: symbol.into(),
            threshold_pct,
            cooldown_seconds,
            current_cooldown_seconds: cooldown_seconds,
            tripped_at: None,
            trip_count: 0,
            halt_reasons: Vec::new(),
        }
    }

    pub fn remaining_cooldown_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.tripped_at
            .map(|at| (at + Duration::seconds(self.current_cooldown_seconds) - now).num_seconds())
            .map_or(0, |secs| secs.max(0))
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.tripped_at
            .is_some_and(|at| at + Duration::seconds(self.current_cooldown_seconds) > now)
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.halt_reasons.last().map(|r| r.reason.as_str())
    }

    pub fn status(&self, now: DateTime<Utc>) -> CircuitStatus {
        CircuitStatus {
            symbol: self.symbol.clone(),
            open: self.is_open(now),
            tripped_at: self.tripped_at,
            remaining_cooldown_seconds: self.remaining_cooldown_seconds(now),
            trip_count: self.trip_count,
            threshold_pct: self.threshold_pct,
            cooldown_seconds: self.current_cooldown_seconds,
            last_reason: self.last_reason().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CircuitDecision {
    Allow,
    Block {
        remaining_seconds: i64,
        reason: String,
    },
}

impl CircuitDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, CircuitDecision::Block { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub symbol: String,
    pub open: bool,
    pub tripped_at: Option<DateTime<Utc>>,
    pub remaining_cooldown_seconds: i64,
    pub trip_count: u32,
    pub threshold_pct: f64,
    pub cooldown_seconds: i64,
    pub last_reason: Option<String>,
}

/// 安全层拒绝：结构化结果而非异常
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyRefusal {
    BudgetFrozen {
        period: RiskPeriod,
        reason: String,
    },
    CircuitOpen {
        symbol: String,
        remaining_seconds: i64,
        reason: String,
    },
}

impl SafetyRefusal {
    pub fn kind(&self) -> FailureKind {
        match self {
            SafetyRefusal::BudgetFrozen { .. } => FailureKind::BudgetFrozen,
            SafetyRefusal::CircuitOpen { .. } => FailureKind::CircuitOpen,
        }
    }

    pub fn to_failure(&self) -> TaskFailure {
        TaskFailure::new(self.kind(), self.to_string())
    }
}

impl fmt::Display for SafetyRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyRefusal::BudgetFrozen { period, reason } => {
                write!(f, "风险预算已冻结 ({period}): {reason}")
            }
            SafetyRefusal::CircuitOpen {
                symbol,
                remaining_seconds,
                reason,
            } => write!(
                f,
                "熔断器已打开: {symbol}，剩余冷却 {remaining_seconds} 秒 ({reason})"
            ),
        }
    }
}

impl From<SafetyRefusal> for SchedulerError {
    fn from(refusal: SafetyRefusal) -> Self {
        match refusal {
            SafetyRefusal::BudgetFrozen { period, reason } => {
                SchedulerError::BudgetFrozen { period, reason }
            }
            SafetyRefusal::CircuitOpen {
                symbol,
                remaining_seconds,
                ..
            } => SchedulerError::CircuitOpen {
                symbol,
                remaining_seconds,
            },
        }
    }
}
