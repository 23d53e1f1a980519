use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskpilot_core::{
    traits::{HandlerContext, HandlerOutcome, TaskHandler},
    SchedulerError, SchedulerResult,
};
use taskpilot_gateway::EndpointGateway;
use tracing::info;

use crate::market_data::MarketDataSource;

#[derive(Debug, Deserialize)]
struct AnalysisParams {
    symbol: String,
    #[serde(default)]
    prices: Option<Vec<f64>>,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_short_window")]
    short_window: usize,
    #[serde(default = "default_long_window")]
    long_window: usize,
}

fn default_interval() -> String {
    "1h".to_string()
}

fn default_limit() -> usize {
    100
}

fn default_short_window() -> usize {
    7
}

fn default_long_window() -> usize {
    25
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Sideways,
}

/// 收盘价序列的技术指标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Indicators {
    pub samples: usize,
    pub last_price: f64,
    pub change_pct: f64,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    /// 逐根收益率的标准差（百分比）
    pub volatility_pct: f64,
    pub trend: Trend,
}

fn sma(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < window {
        return None;
    }
    let tail = &closes[closes.len() - window..];
    Some(tail.iter().sum::<f64>() / window as f64)
}

pub fn compute_indicators(
    closes: &[f64],
    short_window: usize,
    long_window: usize,
) -> SchedulerResult<Indicators> {
    if closes.len() < 2 {
        return Err(SchedulerError::Validation(
            "至少需要两个收盘价才能计算指标".to_string(),
        ));
    }
    if closes.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(SchedulerError::Validation("收盘价必须为正数".to_string()));
    }

    let first = closes[0];
    let last = closes[closes.len() - 1];
    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

    let sma_short = sma(closes, short_window);
    let sma_long = sma(closes, long_window);
    let trend = match (sma_short, sma_long) {
        (Some(short), Some(long)) if short > long * 1.001 => Trend::Up,
        (Some(short), Some(long)) if short < long * 0.999 => Trend::Down,
        (Some(_), Some(_)) => Trend::Sideways,
        _ if last > first * 1.001 => Trend::Up,
        _ if last < first * 0.999 => Trend::Down,
        _ => Trend::Sideways,
    };

    Ok(Indicators {
        samples: closes.len(),
        last_price: last,
        change_pct: (last - first) / first * 100.0,
        sma_short,
        sma_long,
        volatility_pct: variance.sqrt() * 100.0,
        trend,
    })
}

/// 行情分析处理器，支持 `technical` 与 `summary` 两个动作
pub struct MarketAnalysisHandler {
    gateway: Option<Arc<EndpointGateway>>,
    source: Arc<dyn MarketDataSource>,
}

impl MarketAnalysisHandler {
    pub fn new(gateway: Option<Arc<EndpointGateway>>, source: Arc<dyn MarketDataSource>) -> Self {
        Self { gateway, source }
    }

    async fn closing_prices(&self, params: &AnalysisParams) -> SchedulerResult<(Vec<f64>, String)> {
        if let Some(prices) = &params.prices {
            return Ok((prices.clone(), "payload".to_string()));
        }
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            SchedulerError::Validation("未配置行情端点，请在 payload 中提供 prices".to_string())
        })?;

        let limit = params.limit.max(2);
        let (closes, endpoint) = gateway
            .call(|endpoint| {
                let source = self.source.clone();
                let symbol = params.symbol.clone();
                let interval = params.interval.clone();
                async move {
                    source
                        .closing_prices(&endpoint, &symbol, &interval, limit)
                        .await
                }
            })
            .await?;
        Ok((closes, endpoint.name))
    }
}

#[async_trait]
impl TaskHandler for MarketAnalysisHandler {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        let params: AnalysisParams = context.params()?;
        let (closes, source) = self.closing_prices(&params).await?;
        let indicators = compute_indicators(&closes, params.short_window, params.long_window)?;
        info!(
            "行情分析完成: task={}, symbol={}, trend={:?}",
            context.task.id, params.symbol, indicators.trend
        );

        let result = match context.task.action.as_str() {
            "summary" => json!({
                "symbol": params.symbol,
                "source": source,
                "last_price": indicators.last_price,
                "change_pct": indicators.change_pct,
                "trend": indicators.trend,
                "summary": format!(
                    "{} 最新价 {:.4}，区间涨跌 {:+.2}%，波动率 {:.2}%，趋势 {:?}",
                    params.symbol,
                    indicators.last_price,
                    indicators.change_pct,
                    indicators.volatility_pct,
                    indicators.trend
                ),
            }),
            _ => json!({
                "symbol": params.symbol,
                "source": source,
                "interval": params.interval,
                "indicators": indicators,
            }),
        };
        Ok(HandlerOutcome::Completed(result))
    }

    fn name(&self) -> &str {
        "market_analysis"
    }

    fn description(&self) -> &str {
        "计算收盘价序列的均线、波动率与趋势"
    }
}
