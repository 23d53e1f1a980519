use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use taskpilot_core::{
    config::ExecutorConfig,
    models::{CallbackStatus, Task},
    traits::{HandlerContext, HandlerOutcome, TaskRepository},
    HandlerRegistry, SchedulerError, SchedulerResult,
};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::retry_service::{RetryDecision, RetryPolicy};
use crate::tracker::RunningTaskTracker;

/// 任务执行服务
///
/// 单个轮询循环负责选择可运行任务并原子认领（Pending → Acknowledged），
/// 处理器在独立的 tokio 任务中运行，并发数由信号量限制，轮询路径不会被慢任务阻塞。
pub struct TaskExecutorService {
    repository: Arc<dyn TaskRepository>,
    handlers: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    tracker: Arc<RunningTaskTracker>,
    callback_signal: Arc<Notify>,
}

/// 派发到工作任务中的执行上下文
struct Worker {
    repository: Arc<dyn TaskRepository>,
    handlers: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    tracker: Arc<RunningTaskTracker>,
    callback_signal: Arc<Notify>,
}

impl TaskExecutorService {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        handlers: Arc<HandlerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            repository,
            handlers,
            retry_policy: RetryPolicy::from_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            tracker: Arc::new(RunningTaskTracker::new()),
            callback_signal: Arc::new(Notify::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<RunningTaskTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// 任务进入终态且需要回调时唤醒回调投递服务
    pub fn with_callback_signal(mut self, signal: Arc<Notify>) -> Self {
        self.callback_signal = signal;
        self
    }

    pub fn tracker(&self) -> &Arc<RunningTaskTracker> {
        &self.tracker
    }

    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_tasks - self.permits.available_permits()
    }

    fn worker(&self) -> Worker {
        Worker {
            repository: self.repository.clone(),
            handlers: self.handlers.clone(),
            retry_policy: self.retry_policy.clone(),
            tracker: self.tracker.clone(),
            callback_signal: self.callback_signal.clone(),
        }
    }

    /// 执行一轮调度，返回本轮派发的任务数
    pub async fn poll_once(&self) -> SchedulerResult<usize> {
        let available = self.permits.available_permits();
        if available == 0 {
            debug!("工作池已满，跳过本轮调度");
            return Ok(0);
        }

        let now = Utc::now();
        let ready = self.repository.list_ready(available, now).await?;
        let mut dispatched = 0;

        for task in ready {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            match self.repository.acknowledge(&task.id, now).await {
                Ok(task) => {
                    dispatched += 1;
                    counter!("taskpilot_tasks_dispatched_total").increment(1);
                    debug!("派发任务: {} ({}/{})", task.id, task.task_type, task.action);
                    let worker = self.worker();
                    tokio::spawn(async move { worker.run(task, permit).await });
                }
                Err(SchedulerError::InvalidTransition { .. }) => {
                    debug!("任务 {} 已被其他调用方认领", task.id);
                }
                Err(e) => {
                    error!("认领任务 {} 失败: {}", task.id, e);
                }
            }
        }
        Ok(dispatched)
    }

    /// 运行调度循环直到收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "任务执行服务已启动: 轮询间隔 {:?}，最大并发 {}",
            self.config.poll_interval(),
            self.config.max_concurrent_tasks
        );
        let mut ticker = interval(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("调度轮询失败: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("任务执行服务收到关闭信号，在途任务 {} 个", self.in_flight());
                    break;
                }
            }
        }
    }
}

impl Worker {
    async fn run(self, task: Task, _permit: OwnedSemaphorePermit) {
        let id = task.id.clone();
        if let Err(e) = self.execute(task).await {
            error!("任务 {} 执行状态更新失败: {}", id, e);
        }
    }

    async fn execute(&self, task: Task) -> SchedulerResult<()> {
        let Some(handler) = self
            .handlers
            .resolve(&task.task_type, &task.action)
            .await
        else {
            let error = SchedulerError::HandlerNotRegistered {
                task_type: task.task_type.clone(),
                action: task.action.clone(),
            };
            let task = self
                .repository
                .mark_failed(&task.id, error.to_failure(), Utc::now())
                .await?;
            self.finished(&task);
            return Ok(());
        };

        let started = Utc::now();
        let task = match self.repository.mark_running(&task.id, started).await {
            Ok(task) => task,
            Err(SchedulerError::InvalidTransition { from, .. }) => {
                info!("任务 {} 在启动前已变为 {}，放弃执行", task.id, from);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let context = HandlerContext::new(task.clone(), started);
        let timeout = task.timeout();
        let interrupt = self.tracker.register(&task.id);
        info!(
            "开始执行任务: {} ({}/{})，第 {} 次尝试",
            task.id, task.task_type, task.action, context.attempt
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, handler.execute(&context)) => {
                result.unwrap_or(Err(SchedulerError::TimeoutExceeded(timeout)))
            }
            _ = interrupt => Err(SchedulerError::Interrupted("任务已被取消".to_string())),
        };
        self.tracker.remove(&task.id);

        let now = Utc::now();
        let updated = match outcome {
            Ok(HandlerOutcome::Completed(value)) => {
                self.repository.mark_completed(&task.id, value, now).await
            }
            Ok(HandlerOutcome::Refused(refusal)) => {
                warn!("任务 {} 被安全层拒绝: {}", task.id, refusal);
                self.repository
                    .mark_failed(&task.id, refusal.to_failure(), now)
                    .await
            }
            Err(error) => self.handle_error(&task, error, now).await,
        };

        match updated {
            Ok(task) => {
                self.finished(&task);
                Ok(())
            }
            Err(SchedulerError::InvalidTransition { from, .. }) => {
                // 执行期间任务被取消
                info!("任务 {} 已是 {}，丢弃执行结果", task.id, from);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_error(
        &self,
        task: &Task,
        error: SchedulerError,
        now: chrono::DateTime<Utc>,
    ) -> SchedulerResult<Task> {
        match self.retry_policy.decide(task, &error, now) {
            RetryDecision::Requeue {
                failure,
                not_before,
            } => {
                warn!(
                    "任务 {} 第 {} 次尝试失败，{} 后重试: {}",
                    task.id,
                    task.retry_count + 1,
                    not_before,
                    failure
                );
                let task = self
                    .repository
                    .requeue(&task.id, failure, not_before, now)
                    .await?;
                counter!("taskpilot_task_outcomes_total", "status" => "requeued").increment(1);
                Ok(task)
            }
            RetryDecision::Fail(failure) => {
                error!("任务 {} 失败: {}", task.id, failure);
                self.repository.mark_failed(&task.id, failure, now).await
            }
        }
    }

    fn finished(&self, task: &Task) {
        if task.status.is_terminal() {
            counter!("taskpilot_task_outcomes_total", "status" => task.status.as_str())
                .increment(1);
            info!("任务 {} 结束: {}", task.id, task.status);
        }
        if task.callback_status == CallbackStatus::Pending {
            self.callback_signal.notify_one();
        }
    }
}
