//! 任务调度与执行
//!
//! 提交校验、可运行任务选择、带超时与中断的执行、重试决策、
//! 启动恢复以及完成回调投递。

pub mod callback;
pub mod executor;
pub mod publisher;
pub mod recovery_service;
pub mod retry_service;
pub mod tracker;

pub use callback::{CallbackDispatcher, HttpCallbackNotifier};
pub use executor::TaskExecutorService;
pub use publisher::TaskPublisher;
pub use recovery_service::{RecoveryReport, RecoveryService};
pub use retry_service::{RetryDecision, RetryPolicy};
pub use tracker::RunningTaskTracker;
