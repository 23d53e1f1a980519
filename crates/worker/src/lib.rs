pub mod exposure;
pub mod handlers;
pub mod market_data;
pub mod model_client;
pub mod storage;

pub use exposure::{DryRunSink, ExposureReceipt, ExposureSink, TradeIntent, TradeSide};
pub use handlers::{register_builtin_handlers, HandlerDependencies};
pub use market_data::{BinanceKlines, MarketDataSource};
pub use model_client::{ChatMessage, ChatRequest, ChatResponse, ModelClient, OpenAiCompatibleClient};
pub use storage::{
    ContentFormat, FileStorage, SaveRequest, StorageBackend, StorageRegistry, StoredObject,
    FILE_TARGET,
};
