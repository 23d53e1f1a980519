use chrono::{DateTime, Utc};
use taskpilot_core::{
    config::ExecutorConfig,
    models::{Task, TaskFailure},
    BackoffPolicy, SchedulerError,
};
use tracing::debug;

/// 一次失败尝试之后的处理方式
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 重新排队，在 `not_before` 之前不会被调度
    Requeue {
        failure: TaskFailure,
        not_before: DateTime<Utc>,
    },
    /// 直接进入 Failed
    Fail(TaskFailure),
}

/// 执行器的重试策略
///
/// 只有可重试的错误（处理器失败、超时、网关错误、中断）在预算内才会重新排队，
/// 退避时间为 `base * 2^retry_count`，以 `not_before` 的形式写回任务而不是阻塞等待。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.retry_backoff())
    }

    pub fn next_eligible_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay_for(retry_count);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn decide(&self, task: &Task, error: &SchedulerError, now: DateTime<Utc>) -> RetryDecision {
        let failure = error.to_failure();
        if !error.is_retryable() {
            debug!("任务 {} 的错误不可重试: {}", task.id, failure);
            return RetryDecision::Fail(failure);
        }
        if !task.can_retry() {
            debug!(
                "任务 {} 重试预算已用尽 ({}/{})",
                task.id, task.retry_count, task.max_retries
            );
            return RetryDecision::Fail(failure);
        }
        RetryDecision::Requeue {
            failure,
            not_before: self.next_eligible_at(task.retry_count, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use taskpilot_core::models::{FailureKind, RiskPeriod};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(600), 0.0),
        )
    }

    #[test]
    fn test_backoff_doubles_with_retry_count() {
        let now = Utc::now();
        let mut task = Task::new("t", "ai_call", "chat", json!({}), now);
        task.retry_count = 2;

        match policy().decide(&task, &SchedulerError::HandlerFailure("502".into()), now) {
            RetryDecision::Requeue {
                failure,
                not_before,
            } => {
                assert_eq!(failure.kind, FailureKind::HandlerFailure);
                assert_eq!((not_before - now).num_seconds(), 20);
            }
            other => panic!("expected requeue, got {other:?}"),
        }
    }

    #[test]
    fn test_refusals_and_exhausted_budget_fail() {
        let now = Utc::now();
        let mut task = Task::new("t", "trade_execution", "execute", json!({}), now);
        let refusal = SchedulerError::BudgetFrozen {
            period: RiskPeriod::Daily,
            reason: "limit".into(),
        };
        assert!(matches!(
            policy().decide(&task, &refusal, now),
            RetryDecision::Fail(TaskFailure {
                kind: FailureKind::BudgetFrozen,
                ..
            })
        ));

        task.retry_count = task.max_retries;
        let timeout = SchedulerError::TimeoutExceeded(Duration::from_secs(1));
        assert!(matches!(
            policy().decide(&task, &timeout, now),
            RetryDecision::Fail(TaskFailure {
                kind: FailureKind::TimeoutExceeded,
                ..
            })
        ));
    }
}
