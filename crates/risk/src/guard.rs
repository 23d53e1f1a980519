use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use taskpilot_core::{
    models::{CircuitDecision, SafetyRefusal},
    SchedulerResult,
};
use tracing::{info, warn};

use crate::budget::RiskBudgetManager;
use crate::circuit_breaker::CircuitBreakerRegistry;

/// 交易意图在执行前需要检查的市场状况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    /// 最近的价格变动比例，例如 0.06 表示 6%
    #[serde(default)]
    pub move_pct: Option<f64>,
    #[serde(default)]
    pub liquidity_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyDecision {
    Allowed,
    Refused(SafetyRefusal),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allowed)
    }
}

/// 交易前的组合安全闸门：先检查全部周期预算，再检查交易对熔断
pub struct RiskGuard {
    budgets: Arc<RiskBudgetManager>,
    circuits: Arc<CircuitBreakerRegistry>,
}

impl RiskGuard {
    pub fn new(budgets: Arc<RiskBudgetManager>, circuits: Arc<CircuitBreakerRegistry>) -> Self {
        Self { budgets, circuits }
    }

    pub fn budgets(&self) -> &Arc<RiskBudgetManager> {
        &self.budgets
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub async fn evaluate(&self, request: &TradeRequest) -> SchedulerResult<SafetyDecision> {
        if let Some((period, reason)) = self.budgets.first_frozen().await? {
            return Ok(self.refuse(SafetyRefusal::BudgetFrozen { period, reason }));
        }

        let decision = if request.move_pct.is_some() || request.liquidity_score.is_some() {
            self.circuits
                .check_circuit(
                    &request.symbol,
                    request.move_pct.unwrap_or(0.0),
                    request.liquidity_score.unwrap_or(1.0),
                )
                .await?
        } else {
            let status = self.circuits.status(&request.symbol).await;
            if status.open {
                CircuitDecision::Block {
                    remaining_seconds: status.remaining_cooldown_seconds,
                    reason: status.last_reason.unwrap_or_else(|| "冷却中".to_string()),
                }
            } else {
                CircuitDecision::Allow
            }
        };

        match decision {
            CircuitDecision::Allow => {
                info!("交易 {} 通过风险检查", request.symbol);
                Ok(SafetyDecision::Allowed)
            }
            CircuitDecision::Block {
                remaining_seconds,
                reason,
            } => Ok(self.refuse(SafetyRefusal::CircuitOpen {
                symbol: request.symbol.clone(),
                remaining_seconds,
                reason,
            })),
        }
    }

    fn refuse(&self, refusal: SafetyRefusal) -> SafetyDecision {
        warn!("安全层拒绝: {}", refusal);
        counter!("taskpilot_risk_refusals_total", "kind" => refusal.kind().as_str()).increment(1);
        SafetyDecision::Refused(refusal)
    }
}
