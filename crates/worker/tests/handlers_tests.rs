use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use taskpilot_core::{
    config::{ExecutorConfig, GatewayConfig, RiskConfig},
    models::{FailureKind, RiskPeriod},
    traits::{HandlerContext, HandlerOutcome, TaskHandler},
    HandlerRegistry, SchedulerError,
};
use taskpilot_gateway::EndpointGateway;
use taskpilot_risk::{CircuitBreakerRegistry, RiskBudgetManager, RiskGuard};
use taskpilot_testing_utils::{EndpointConfigBuilder, TaskBuilder};
use taskpilot_worker::{
    handlers::{
        AiCallHandler, MarketAnalysisHandler, ReportGenerationHandler, StorageSaveHandler,
        TradeExecutionHandler,
    },
    register_builtin_handlers, BinanceKlines, DryRunSink, FileStorage, HandlerDependencies,
    OpenAiCompatibleClient, StorageRegistry,
};

fn context(task_type: &str, action: &str, payload: Value) -> HandlerContext {
    let task = TaskBuilder::new()
        .with_type(task_type, action)
        .with_payload(payload)
        .build();
    HandlerContext::new(task, Utc::now())
}

fn completed(outcome: HandlerOutcome) -> Value {
    match outcome {
        HandlerOutcome::Completed(value) => value,
        HandlerOutcome::Refused(refusal) => panic!("unexpected refusal: {refusal}"),
    }
}

fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Default::default()
    }
}

async fn gateway_for(urls: &[(&str, String)]) -> Arc<EndpointGateway> {
    let endpoints: Vec<_> = urls
        .iter()
        .enumerate()
        .map(|(i, (name, url))| {
            EndpointConfigBuilder::new(name)
                .with_base_url(url)
                .with_priority(i as u32 + 1)
                .build()
        })
        .collect();
    Arc::new(
        EndpointGateway::with_endpoints(&gateway_config(), &endpoints, None)
            .await
            .unwrap(),
    )
}

fn risk_guard() -> Arc<RiskGuard> {
    let config = RiskConfig::default();
    Arc::new(RiskGuard::new(
        Arc::new(RiskBudgetManager::new(&config)),
        Arc::new(CircuitBreakerRegistry::new(&config)),
    ))
}

async fn file_storage(root: &std::path::Path) -> Arc<StorageRegistry> {
    let storage = Arc::new(StorageRegistry::new());
    storage.register(Arc::new(FileStorage::new(root))).await;
    storage
}

const COMPLETION: &str =
    r#"{"choices":[{"message":{"role":"assistant","content":"市场平稳"}}],"usage":{"total_tokens":12}}"#;

#[tokio::test]
async fn test_ai_call_fails_over_to_healthy_endpoint() {
    let mut broken = mockito::Server::new_async().await;
    let mut healthy = mockito::Server::new_async().await;
    let _down = broken
        .mock("POST", "/chat/completions")
        .with_status(503)
        .create_async()
        .await;
    let up = healthy
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(COMPLETION)
        .create_async()
        .await;

    let gateway = gateway_for(&[("primary", broken.url()), ("secondary", healthy.url())]).await;
    let handler = AiCallHandler::new(gateway.clone(), Arc::new(OpenAiCompatibleClient::default()));

    let result = completed(
        handler
            .execute(&context("ai_call", "chat", json!({"prompt": "总结今日行情"})))
            .await
            .unwrap(),
    );

    up.assert_async().await;
    assert_eq!(result["endpoint"], "secondary");
    assert_eq!(result["content"], "市场平稳");
    assert_eq!(result["total_tokens"], 12);

    let snapshot = gateway.snapshot().await;
    let primary = snapshot.iter().find(|s| s.name == "primary").unwrap();
    assert_eq!(primary.failure_count, 1);
}

#[tokio::test]
async fn test_ai_call_pinned_endpoint_and_bad_input() {
    let mut first = mockito::Server::new_async().await;
    let mut second = mockito::Server::new_async().await;
    let _first = first
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(COMPLETION)
        .expect(0)
        .create_async()
        .await;
    let pinned = second
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(COMPLETION)
        .create_async()
        .await;

    let gateway = gateway_for(&[("first", first.url()), ("second", second.url())]).await;
    let handler = AiCallHandler::new(gateway, Arc::new(OpenAiCompatibleClient::default()));

    let result = completed(
        handler
            .execute(&context(
                "ai_call",
                "chat",
                json!({"prompt": "hi", "endpoint": "second", "system": "简洁回答"}),
            ))
            .await
            .unwrap(),
    );
    pinned.assert_async().await;
    assert_eq!(result["endpoint"], "second");

    let err = handler
        .execute(&context("ai_call", "chat", json!({"system": "no prompt"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let err = handler
        .execute(&context("ai_call", "chat", json!({"prompt": "hi", "endpoint": "ghost"})))
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::NoEndpointAvailable);
}

#[tokio::test]
async fn test_market_analysis_from_payload_prices() {
    let handler = MarketAnalysisHandler::new(None, Arc::new(BinanceKlines::default()));
    let prices: Vec<f64> = (0..30).map(|i| 200.0 - i as f64).collect();

    let summary = completed(
        handler
            .execute(&context(
                "market_analysis",
                "summary",
                json!({"symbol": "ETH/USDT", "prices": prices}),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(summary["trend"], "down");
    assert_eq!(summary["source"], "payload");
    assert_eq!(summary["last_price"], 171.0);
    assert!(summary["summary"].as_str().unwrap().contains("ETH/USDT"));

    let err = handler
        .execute(&context("market_analysis", "technical", json!({"symbol": "ETH/USDT"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

#[tokio::test]
async fn test_market_analysis_fetches_klines_through_gateway() {
    let mut server = mockito::Server::new_async().await;
    let rows: Vec<Value> = (1..=30)
        .map(|i| json!([i, "0", "0", "0", format!("{}", 100 + i), "1"]))
        .collect();
    let klines = server
        .mock("GET", "/api/v3/klines")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(Value::Array(rows).to_string())
        .create_async()
        .await;

    let gateway = gateway_for(&[("binance", server.url())]).await;
    let handler = MarketAnalysisHandler::new(Some(gateway), Arc::new(BinanceKlines::default()));
    let result = completed(
        handler
            .execute(&context(
                "market_analysis",
                "technical",
                json!({"symbol": "BTC/USDT", "limit": 30}),
            ))
            .await
            .unwrap(),
    );

    klines.assert_async().await;
    assert_eq!(result["source"], "binance");
    assert_eq!(result["indicators"]["last_price"], 130.0);
    assert_eq!(result["indicators"]["sma_short"], 127.0);
    assert_eq!(result["indicators"]["trend"], "up");
}

#[tokio::test]
async fn test_report_generation_saves_to_file_target() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ReportGenerationHandler::new(file_storage(dir.path()).await);

    let result = completed(
        handler
            .execute(&context(
                "report_generation",
                "daily",
                json!({
                    "title": "Daily Report",
                    "sections": [{"heading": "Market", "body": "BTC up 2%"}],
                    "storage_target": "file",
                    "subdir": "reports"
                }),
            ))
            .await
            .unwrap(),
    );

    let location = result["stored"]["location"].as_str().unwrap();
    let written = tokio::fs::read_to_string(location).await.unwrap();
    assert_eq!(written, result["content"].as_str().unwrap());
    assert!(written.starts_with("# Daily Report\n\n## Market"));

    let err = handler
        .execute(&context(
            "report_generation",
            "daily",
            json!({"title": "x", "storage_target": "notion"}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

#[tokio::test]
async fn test_storage_save_serializes_structured_content() {
    let dir = tempfile::tempdir().unwrap();
    let handler = StorageSaveHandler::new(file_storage(dir.path()).await);

    let result = completed(
        handler
            .execute(&context(
                "storage_save",
                "snapshot",
                json!({"title": "positions", "content": {"BTC": 0.5}}),
            ))
            .await
            .unwrap(),
    );

    let location = result["location"].as_str().unwrap();
    assert!(location.ends_with(".json"));
    let saved: Value =
        serde_json::from_str(&tokio::fs::read_to_string(location).await.unwrap()).unwrap();
    assert_eq!(saved, json!({"BTC": 0.5}));
}

#[tokio::test]
async fn test_trade_execution_is_gated_by_risk_guard() {
    let guard = risk_guard();
    let sink = Arc::new(DryRunSink::new());
    let handler = TradeExecutionHandler::new(guard.clone(), sink.clone());
    let order = json!({"symbol": "BTC/USDT", "side": "buy", "quantity": 0.1, "move_pct": 0.01});

    let accepted = completed(
        handler
            .execute(&context("trade_execution", "execute", order.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(accepted["receipt"]["dry_run"], true);
    assert_eq!(sink.submitted().await.len(), 1);

    completed(
        handler
            .execute(&context(
                "trade_execution",
                "report_loss",
                json!({"amount": -600.0, "period": "daily"}),
            ))
            .await
            .unwrap(),
    );
    assert!(guard
        .budgets()
        .check_budget(RiskPeriod::Daily)
        .await
        .unwrap()
        .is_frozen());

    match handler
        .execute(&context("trade_execution", "execute", order))
        .await
        .unwrap()
    {
        HandlerOutcome::Refused(refusal) => assert_eq!(refusal.kind(), FailureKind::BudgetFrozen),
        HandlerOutcome::Completed(value) => panic!("trade must be refused, got {value}"),
    }
    assert_eq!(sink.submitted().await.len(), 1);
}

#[tokio::test]
async fn test_builtin_handlers_cover_required_types() {
    let dir = tempfile::tempdir().unwrap();
    let registry = HandlerRegistry::new();
    register_builtin_handlers(
        &registry,
        HandlerDependencies {
            ai_gateway: gateway_for(&[]).await,
            market_gateway: None,
            model_client: Arc::new(OpenAiCompatibleClient::default()),
            market_source: Arc::new(BinanceKlines::default()),
            storage: file_storage(dir.path()).await,
            risk_guard: risk_guard(),
            exposure_sink: Arc::new(DryRunSink::new()),
        },
    )
    .await;

    registry
        .validate_coverage(&ExecutorConfig::default().required_task_types)
        .await
        .unwrap();
    assert!(registry.supports("ai_call", "anything").await);
    assert!(registry.supports("market_analysis", "summary").await);
    assert!(!registry.supports("market_analysis", "backtest").await);
    assert!(!registry.supports("trade_execution", "withdraw").await);
}
