pub mod ai_call;
pub mod market_analysis;
pub mod report_generation;
pub mod storage_save;
pub mod trade_execution;

use std::sync::Arc;

use taskpilot_core::HandlerRegistry;
use taskpilot_gateway::EndpointGateway;
use taskpilot_risk::RiskGuard;
use tracing::info;

use crate::exposure::ExposureSink;
use crate::market_data::MarketDataSource;
use crate::model_client::ModelClient;
use crate::storage::StorageRegistry;

pub use ai_call::AiCallHandler;
pub use market_analysis::{compute_indicators, Indicators, MarketAnalysisHandler, Trend};
pub use report_generation::{render_markdown, ReportGenerationHandler, ReportSection};
pub use storage_save::StorageSaveHandler;
pub use trade_execution::TradeExecutionHandler;

/// 内置处理器依赖的外部组件
pub struct HandlerDependencies {
    pub ai_gateway: Arc<EndpointGateway>,
    /// 未配置行情端点时，行情分析只接受 payload 中的价格
    pub market_gateway: Option<Arc<EndpointGateway>>,
    pub model_client: Arc<dyn ModelClient>,
    pub market_source: Arc<dyn MarketDataSource>,
    pub storage: Arc<StorageRegistry>,
    pub risk_guard: Arc<RiskGuard>,
    pub exposure_sink: Arc<dyn ExposureSink>,
}

/// 注册全部内置处理器
pub async fn register_builtin_handlers(registry: &HandlerRegistry, deps: HandlerDependencies) {
    let market = Arc::new(MarketAnalysisHandler::new(
        deps.market_gateway,
        deps.market_source,
    ));
    registry.register("market_analysis", "technical", market.clone()).await;
    registry.register("market_analysis", "summary", market).await;

    registry
        .register_any(
            "ai_call",
            Arc::new(AiCallHandler::new(deps.ai_gateway, deps.model_client)),
        )
        .await;
    registry
        .register_any(
            "report_generation",
            Arc::new(ReportGenerationHandler::new(deps.storage.clone())),
        )
        .await;
    registry
        .register_any(
            "storage_save",
            Arc::new(StorageSaveHandler::new(deps.storage)),
        )
        .await;

    let trade = Arc::new(TradeExecutionHandler::new(
        deps.risk_guard,
        deps.exposure_sink,
    ));
    registry.register("trade_execution", "execute", trade.clone()).await;
    registry.register("trade_execution", "report_loss", trade).await;

    info!("内置处理器注册完成: {:?}", registry.task_types().await);
}
