use std::sync::Arc;

use anyhow::{Context, Result};
use taskpilot_core::{
    traits::{StateRepository, TaskRepository},
    AppConfig, HandlerRegistry,
};
use taskpilot_dispatcher::{
    CallbackDispatcher, HttpCallbackNotifier, RecoveryService, RetryPolicy, TaskExecutorService,
    TaskPublisher,
};
use taskpilot_gateway::EndpointGateway;
use taskpilot_infrastructure::{
    CleanupService, DatabaseManager, InMemoryStateRepository, InMemoryTaskRepository,
    SqliteStateRepository, SqliteTaskRepository,
};
use taskpilot_risk::{CircuitBreakerRegistry, RiskBudgetManager, RiskGuard};
use taskpilot_worker::{
    register_builtin_handlers, BinanceKlines, DryRunSink, FileStorage, HandlerDependencies,
    OpenAiCompatibleClient, StorageRegistry,
};
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};

/// 组装完成的编排引擎
pub struct Application {
    config: AppConfig,
    database: Option<DatabaseManager>,
    repository: Arc<dyn TaskRepository>,
    publisher: Arc<TaskPublisher>,
    executor: Arc<TaskExecutorService>,
    callbacks: Arc<CallbackDispatcher>,
    recovery: RecoveryService,
    risk_guard: Arc<RiskGuard>,
    ai_gateway: Arc<EndpointGateway>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let (database, repository, state) = open_stores(&config).await?;

        let ai_gateway = Arc::new(
            EndpointGateway::from_config(&config.gateway, Some(state.clone()))
                .await
                .context("初始化AI端点网关失败")?,
        );
        let market_gateway = if config.gateway.market_endpoints.is_empty() {
            info!("未配置行情端点，行情分析仅使用请求中提供的价格");
            None
        } else {
            let gateway = EndpointGateway::with_endpoints(
                &config.gateway,
                &config.gateway.market_endpoints,
                Some(state.clone()),
            )
            .await
            .context("初始化行情端点网关失败")?;
            Some(Arc::new(gateway))
        };

        let budgets = Arc::new(
            RiskBudgetManager::new(&config.risk).with_state_repository(state.clone()),
        );
        let circuits = Arc::new(
            CircuitBreakerRegistry::new(&config.risk).with_state_repository(state.clone()),
        );
        let loaded_budgets = budgets.load().await.context("加载风险预算失败")?;
        let loaded_circuits = circuits.load().await.context("加载熔断器状态失败")?;
        info!(
            "风险状态已加载: {} 个预算周期，{} 个熔断器",
            loaded_budgets, loaded_circuits
        );
        let risk_guard = Arc::new(RiskGuard::new(budgets, circuits));

        let storage = Arc::new(StorageRegistry::new());
        storage
            .register(Arc::new(FileStorage::new(&config.storage.root_dir)))
            .await;

        let handlers = Arc::new(HandlerRegistry::new());
        register_builtin_handlers(
            &handlers,
            HandlerDependencies {
                ai_gateway: ai_gateway.clone(),
                market_gateway,
                model_client: Arc::new(OpenAiCompatibleClient::default()),
                market_source: Arc::new(BinanceKlines::default()),
                storage,
                risk_guard: risk_guard.clone(),
                exposure_sink: Arc::new(DryRunSink::new()),
            },
        )
        .await;
        handlers
            .validate_coverage(&config.executor.required_task_types)
            .await
            .context("处理器注册不完整")?;

        let callback_signal = Arc::new(Notify::new());
        let executor = Arc::new(
            TaskExecutorService::new(repository.clone(), handlers.clone(), config.executor.clone())
                .with_callback_signal(callback_signal.clone()),
        );
        let publisher = Arc::new(
            TaskPublisher::new(repository.clone(), handlers, config.executor.clone())
                .with_tracker(executor.tracker().clone())
                .with_callback_signal(callback_signal.clone()),
        );

        let notifier = HttpCallbackNotifier::new(config.callback.request_timeout())
            .context("创建回调客户端失败")?;
        let callbacks = Arc::new(
            CallbackDispatcher::new(repository.clone(), Arc::new(notifier), config.callback.clone())
                .with_signal(callback_signal),
        );
        let recovery = RecoveryService::new(
            repository.clone(),
            RetryPolicy::from_config(&config.executor),
        );

        Ok(Self {
            config,
            database,
            repository,
            publisher,
            executor,
            callbacks,
            recovery,
            risk_guard,
            ai_gateway,
        })
    }

    pub fn publisher(&self) -> &Arc<TaskPublisher> {
        &self.publisher
    }

    pub fn risk_guard(&self) -> &Arc<RiskGuard> {
        &self.risk_guard
    }

    pub fn ai_gateway(&self) -> &Arc<EndpointGateway> {
        &self.ai_gateway
    }

    /// 运行全部后台循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let report = self
            .recovery
            .recover_interrupted()
            .await
            .context("启动恢复失败")?;
        if !report.errors.is_empty() {
            warn!("{} 个中断任务恢复失败", report.errors.len());
        }

        let mut cleanup = CleanupService::new(self.repository.clone(), self.config.retention.clone());
        cleanup.start().await.context("启动清理服务失败")?;

        let executor = self.executor.clone();
        let executor_rx = shutdown_rx.resubscribe();
        let executor_handle = tokio::spawn(async move { executor.run(executor_rx).await });

        let callbacks = self.callbacks.clone();
        let callbacks_rx = shutdown_rx.resubscribe();
        let callbacks_handle = tokio::spawn(async move { callbacks.run(callbacks_rx).await });

        info!("TaskPilot 已启动");
        let _ = shutdown_rx.recv().await;

        for (name, handle) in [("执行服务", executor_handle), ("回调服务", callbacks_handle)] {
            if let Err(e) = handle.await {
                error!("{}退出异常: {}", name, e);
            }
        }
        if let Err(e) = cleanup.stop().await {
            warn!("停止清理服务失败: {}", e);
        }
        if let Some(database) = &self.database {
            database.close().await;
        }
        info!("TaskPilot 已停止");
        Ok(())
    }
}

async fn open_stores(
    config: &AppConfig,
) -> Result<(
    Option<DatabaseManager>,
    Arc<dyn TaskRepository>,
    Arc<dyn StateRepository>,
)> {
    if config.database.is_in_memory() {
        info!("使用内存存储，进程退出后数据不保留");
        return Ok((
            None,
            Arc::new(InMemoryTaskRepository::new()),
            Arc::new(InMemoryStateRepository::new()),
        ));
    }

    let database = DatabaseManager::new(&config.database).await?;
    database.migrate().await.context("数据库迁移失败")?;
    let tasks = Arc::new(SqliteTaskRepository::new(database.pool().clone()));
    let state = Arc::new(SqliteStateRepository::new(database.pool().clone()));
    Ok((Some(database), tasks, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use taskpilot_core::{models::TaskStatus, TaskSubmission};

    fn memory_config(storage_root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = "memory".to_string();
        config.executor.poll_interval_ms = 20;
        config.storage.root_dir = storage_root.display().to_string();
        config.retention.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_application_runs_submitted_task() {
        let dir = tempfile::tempdir().unwrap();
        let app = Arc::new(Application::new(memory_config(dir.path())).await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = app.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let receipt = app
            .publisher()
            .submit(TaskSubmission::new(
                "storage_save",
                "save",
                json!({"title": "notes", "content": "hello"}),
            ))
            .await
            .unwrap();
        let task = app
            .publisher()
            .wait_for(&receipt.task_id, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
