pub mod backoff;
pub mod config;
pub mod errors;
pub mod handler_registry;
pub mod models;
pub mod traits;

pub use backoff::BackoffPolicy;
pub use config::AppConfig;
pub use errors::*;
pub use handler_registry::{HandlerInfo, HandlerRegistry};
pub use models::{
    CallbackStatus, FailureKind, SubmissionReceipt, Task, TaskFailure, TaskFilter, TaskId,
    TaskPriority, TaskStats, TaskStatus, TaskSubmission, TaskView,
};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
