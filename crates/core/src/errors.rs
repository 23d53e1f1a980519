use std::time::Duration;

use thiserror::Error;

use crate::models::{FailureKind, RiskPeriod, TaskFailure, TaskStatus};

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("任务 {id} 无法从 {from} 转换到 {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("任务 {id} 的重试次数已用尽 (max_retries={max_retries})")]
    RetryBudgetExhausted { id: String, max_retries: u32 },

    #[error("未注册的任务处理器: type={task_type}, action={action}")]
    HandlerNotRegistered { task_type: String, action: String },

    #[error("任务处理失败: {0}")]
    HandlerFailure(String),

    #[error("任务执行超时 ({0:?})")]
    TimeoutExceeded(Duration),

    #[error("任务执行被中断: {0}")]
    Interrupted(String),

    #[error("没有可用的端点")]
    NoEndpointAvailable,

    #[error("端点未找到: {name}")]
    EndpointNotFound { name: String },

    #[error("端点重试耗尽 (共 {attempts} 次尝试): {last_error}")]
    AllAttemptsExhausted { attempts: u32, last_error: String },

    #[error("风险预算已冻结 ({period}): {reason}")]
    BudgetFrozen { period: RiskPeriod, reason: String },

    #[error("熔断器已打开: {symbol}，剩余冷却 {remaining_seconds} 秒")]
    CircuitOpen {
        symbol: String,
        remaining_seconds: i64,
    },

    #[error("回调投递失败: {0}")]
    Callback(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 错误对应的可机器判定的失败类别
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SchedulerError::Validation(_) => FailureKind::Validation,
            SchedulerError::TimeoutExceeded(_) => FailureKind::TimeoutExceeded,
            SchedulerError::Interrupted(_) => FailureKind::Interrupted,
            SchedulerError::NoEndpointAvailable | SchedulerError::EndpointNotFound { .. } => {
                FailureKind::NoEndpointAvailable
            }
            SchedulerError::AllAttemptsExhausted { .. } => FailureKind::AllAttemptsExhausted,
            SchedulerError::BudgetFrozen { .. } => FailureKind::BudgetFrozen,
            SchedulerError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            SchedulerError::HandlerNotRegistered { .. } => FailureKind::HandlerNotRegistered,
            _ => FailureKind::HandlerFailure,
        }
    }

    /// 执行器是否可以通过重新排队来恢复此错误
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_retryable()
    }

    pub fn to_failure(&self) -> TaskFailure {
        TaskFailure::new(self.failure_kind(), self.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_refusals_are_never_retryable() {
        let frozen = SchedulerError::BudgetFrozen {
            period: RiskPeriod::Daily,
            reason: "exceeded".to_string(),
        };
        let open = SchedulerError::CircuitOpen {
            symbol: "BTC/USDT".to_string(),
            remaining_seconds: 10,
        };
        assert!(!frozen.is_retryable());
        assert!(!open.is_retryable());
        assert_eq!(open.failure_kind(), FailureKind::CircuitOpen);
    }

    #[test]
    fn gateway_and_handler_errors_drive_retries() {
        assert!(SchedulerError::HandlerFailure("boom".into()).is_retryable());
        assert!(SchedulerError::TimeoutExceeded(Duration::from_secs(1)).is_retryable());
        assert!(SchedulerError::NoEndpointAvailable.is_retryable());
        assert!(!SchedulerError::Validation("bad".into()).is_retryable());

        let failure = SchedulerError::AllAttemptsExhausted {
            attempts: 3,
            last_error: "502".into(),
        }
        .to_failure();
        assert_eq!(failure.kind, FailureKind::AllAttemptsExhausted);
        assert!(failure.message.contains("502"));
    }
}
