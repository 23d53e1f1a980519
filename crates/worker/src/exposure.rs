use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskpilot_core::{SchedulerError, SchedulerResult};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// 已通过风险闸门的交易意图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
}

impl TradeIntent {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(SchedulerError::Validation("交易对不能为空".to_string()));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(SchedulerError::Validation(format!(
                "交易数量必须为正数: {}",
                self.quantity
            )));
        }
        if self.limit_price.is_some_and(|p| !p.is_finite() || p <= 0.0) {
            return Err(SchedulerError::Validation("限价必须为正数".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureReceipt {
    pub reference: String,
    pub dry_run: bool,
    pub accepted_at: DateTime<Utc>,
}

/// 产生资金敞口的下游执行通道
///
/// 只有在 [`RiskGuard`](taskpilot_risk::RiskGuard) 放行后才会调用。
#[async_trait]
pub trait ExposureSink: Send + Sync {
    async fn submit(&self, intent: &TradeIntent) -> SchedulerResult<ExposureReceipt>;
}

/// 只记录不下单的执行通道
#[derive(Default)]
pub struct DryRunSink {
    submitted: Mutex<Vec<TradeIntent>>,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submitted(&self) -> Vec<TradeIntent> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl ExposureSink for DryRunSink {
    async fn submit(&self, intent: &TradeIntent) -> SchedulerResult<ExposureReceipt> {
        let mut submitted = self.submitted.lock().await;
        submitted.push(intent.clone());
        info!(
            "模拟下单: {:?} {} x {}",
            intent.side, intent.symbol, intent.quantity
        );
        Ok(ExposureReceipt {
            reference: format!("dry-run-{}", submitted.len()),
            dry_run: true,
            accepted_at: Utc::now(),
        })
    }
}
