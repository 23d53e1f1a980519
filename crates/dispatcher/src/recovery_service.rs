use std::sync::Arc;

use chrono::Utc;
use taskpilot_core::{
    models::{FailureKind, TaskFailure, TaskStatus},
    traits::TaskRepository,
    SchedulerResult, TaskId,
};
use tracing::{info, warn};

use crate::retry_service::RetryPolicy;

/// 启动恢复报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub requeued: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}

/// 启动恢复服务
///
/// 上一个进程退出时仍处于 Acknowledged/Running 的任务不会再有执行者，
/// 预算允许时以 `interrupted` 原因重新排队，否则标记为失败。
pub struct RecoveryService {
    repository: Arc<dyn TaskRepository>,
    retry_policy: RetryPolicy,
}

impl RecoveryService {
    pub fn new(repository: Arc<dyn TaskRepository>, retry_policy: RetryPolicy) -> Self {
        Self {
            repository,
            retry_policy,
        }
    }

    pub async fn recover_interrupted(&self) -> SchedulerResult<RecoveryReport> {
        let in_flight = self.repository.list_in_flight().await?;
        let mut report = RecoveryReport::default();
        if in_flight.is_empty() {
            return Ok(report);
        }
        info!("发现 {} 个中断的任务，开始恢复", in_flight.len());

        for task in in_flight {
            let now = Utc::now();
            let failure = TaskFailure::new(
                FailureKind::Interrupted,
                format!("进程重启时任务处于 {} 状态", task.status),
            );
            let result = if task.can_retry() {
                let not_before = self.retry_policy.next_eligible_at(task.retry_count, now);
                self.repository
                    .requeue(&task.id, failure, not_before, now)
                    .await
            } else {
                self.repository.mark_failed(&task.id, failure, now).await
            };

            match result {
                Ok(updated) if updated.status == TaskStatus::Pending => {
                    report.requeued.push(updated.id)
                }
                Ok(updated) => report.failed.push(updated.id),
                Err(e) => {
                    warn!("恢复任务 {} 失败: {}", task.id, e);
                    report.errors.push(format!("{}: {}", task.id, e));
                }
            }
        }

        info!(
            "任务恢复完成: 重新排队 {} 个，失败 {} 个",
            report.requeued.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
