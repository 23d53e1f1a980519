use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use taskpilot_core::{
    models::RiskPeriod,
    traits::{HandlerContext, HandlerOutcome, TaskHandler},
    SchedulerError, SchedulerResult,
};
use taskpilot_risk::{RiskGuard, SafetyDecision, TradeRequest};
use tracing::{info, warn};

use crate::exposure::{ExposureSink, TradeIntent};

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    #[serde(flatten)]
    intent: TradeIntent,
    #[serde(default)]
    move_pct: Option<f64>,
    #[serde(default)]
    liquidity_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LossParams {
    amount: f64,
    #[serde(default)]
    period: Option<RiskPeriod>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

/// 交易执行处理器
///
/// `execute` 必须先通过 [`RiskGuard`]，被拒绝时以 [`HandlerOutcome::Refused`]
/// 结束且不触达 [`ExposureSink`]；`report_loss` 把已实现亏损计入风险预算。
pub struct TradeExecutionHandler {
    guard: Arc<RiskGuard>,
    sink: Arc<dyn ExposureSink>,
}

impl TradeExecutionHandler {
    pub fn new(guard: Arc<RiskGuard>, sink: Arc<dyn ExposureSink>) -> Self {
        Self { guard, sink }
    }

    async fn execute_trade(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        let params: ExecuteParams = context.params()?;
        params.intent.validate()?;

        let request = TradeRequest {
            symbol: params.intent.symbol.clone(),
            move_pct: params.move_pct,
            liquidity_score: params.liquidity_score,
        };
        if let SafetyDecision::Refused(refusal) = self.guard.evaluate(&request).await? {
            warn!("交易被拒绝: task={}, {}", context.task.id, refusal);
            return Ok(HandlerOutcome::Refused(refusal));
        }

        let receipt = self.sink.submit(&params.intent).await?;
        info!(
            "交易已提交: task={}, symbol={}, reference={}",
            context.task.id, params.intent.symbol, receipt.reference
        );
        Ok(HandlerOutcome::Completed(json!({
            "symbol": params.intent.symbol,
            "side": params.intent.side,
            "quantity": params.intent.quantity,
            "receipt": receipt,
        })))
    }

    async fn report_loss(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        let params: LossParams = context.params()?;
        let budgets = self.guard.budgets();

        let result = match params.period {
            Some(period) => {
                let decision = budgets.record_loss(params.amount, period).await?;
                json!({ "period": period, "decision": decision })
            }
            None => {
                let updated = budgets
                    .record_loss_all(params.amount, params.tag, params.note)
                    .await?;
                json!({ "budgets": updated })
            }
        };
        Ok(HandlerOutcome::Completed(result))
    }
}

#[async_trait]
impl TaskHandler for TradeExecutionHandler {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        match context.task.action.as_str() {
            "execute" => self.execute_trade(context).await,
            "report_loss" => self.report_loss(context).await,
            other => Err(SchedulerError::Validation(format!(
                "trade_execution 不支持的动作: {other}"
            ))),
        }
    }

    fn name(&self) -> &str {
        "trade_execution"
    }

    fn description(&self) -> &str {
        "经风险闸门检查后提交交易意图"
    }
}
