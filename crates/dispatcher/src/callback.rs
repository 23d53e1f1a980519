use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use reqwest::Client;
use taskpilot_core::{
    config::CallbackConfig,
    models::{CallbackStatus, Task},
    traits::{CallbackNotifier, CallbackPayload, TaskRepository},
    BackoffPolicy, SchedulerError, SchedulerResult,
};
use tokio::sync::{broadcast, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// 通过 HTTP POST JSON 投递回调
pub struct HttpCallbackNotifier {
    client: Client,
}

impl HttpCallbackNotifier {
    pub fn new(request_timeout: Duration) -> SchedulerResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> SchedulerResult<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| SchedulerError::Callback(format!("请求 {url} 失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SchedulerError::Callback(format!("{url} 返回 {status}")))
        }
    }
}

/// 回调投递服务
///
/// 轮询 `callback_status = pending` 的终态任务，每个回调最多尝试 `max_attempts` 次，
/// 两次尝试之间按带抖动的指数退避等待，最终记录为 delivered 或 dropped。
pub struct CallbackDispatcher {
    repository: Arc<dyn TaskRepository>,
    notifier: Arc<dyn CallbackNotifier>,
    config: CallbackConfig,
    backoff: BackoffPolicy,
    signal: Arc<Notify>,
}

impl CallbackDispatcher {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        notifier: Arc<dyn CallbackNotifier>,
        config: CallbackConfig,
    ) -> Self {
        Self {
            repository,
            notifier,
            backoff: config.backoff(),
            config,
            signal: Arc::new(Notify::new()),
        }
    }

    pub fn with_signal(mut self, signal: Arc<Notify>) -> Self {
        self.signal = signal;
        self
    }

    pub fn signal(&self) -> &Arc<Notify> {
        &self.signal
    }

    /// 投递一批待处理的回调，返回处理的任务数
    pub async fn deliver_pending(&self) -> SchedulerResult<usize> {
        let pending = self
            .repository
            .pending_callbacks(self.config.batch_size)
            .await?;
        let count = pending.len();
        for task in pending {
            if let Err(e) = self.deliver(&task).await {
                error!("记录任务 {} 的回调结果失败: {}", task.id, e);
            }
        }
        Ok(count)
    }

    pub async fn deliver(&self, task: &Task) -> SchedulerResult<Task> {
        let Some(url) = task.callback_url.as_deref() else {
            warn!("任务 {} 需要回调但没有回调地址", task.id);
            return self
                .record(task, CallbackStatus::Dropped, 0, Some("缺少回调地址".to_string()))
                .await;
        };

        let payload = CallbackPayload::from_task(task);
        let mut last_error = None;
        for attempt in 1..=self.config.max_attempts {
            match self.notifier.notify(url, &payload).await {
                Ok(()) => {
                    debug!("任务 {} 回调已送达 (第 {} 次)", task.id, attempt);
                    return self
                        .record(task, CallbackStatus::Delivered, attempt, None)
                        .await;
                }
                Err(e) => {
                    warn!(
                        "任务 {} 回调失败 (第 {}/{} 次): {}",
                        task.id, attempt, self.config.max_attempts, e
                    );
                    last_error = Some(e.to_string());
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.backoff.delay_for(attempt - 1)).await;
                    }
                }
            }
        }

        error!("任务 {} 的回调已放弃: {:?}", task.id, last_error);
        self.record(
            task,
            CallbackStatus::Dropped,
            self.config.max_attempts,
            last_error,
        )
        .await
    }

    async fn record(
        &self,
        task: &Task,
        status: CallbackStatus,
        attempts: u32,
        error: Option<String>,
    ) -> SchedulerResult<Task> {
        counter!("taskpilot_callbacks_total", "outcome" => status.as_str()).increment(1);
        self.repository
            .record_callback(&task.id, status, attempts, error, Utc::now())
            .await
    }

    /// 运行投递循环直到收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("回调投递服务已启动");
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.signal.notified() => {}
                _ = shutdown.recv() => {
                    info!("回调投递服务收到关闭信号");
                    break;
                }
            }
            if let Err(e) = self.deliver_pending().await {
                error!("回调投递失败: {}", e);
            }
        }
    }
}
