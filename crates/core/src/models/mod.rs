pub mod endpoint;
pub mod risk;
pub mod submission;
pub mod task;

pub use endpoint::{CallSample, Endpoint, EndpointConfig, EndpointStats, EndpointStatus};
pub use risk::{
    BudgetDecision, CircuitBreakerState, CircuitDecision, CircuitStatus, CooldownPolicy,
    HaltReason, LossEvent, RiskBudget, RiskPeriod, SafetyRefusal,
};
pub use submission::{SubmissionReceipt, TaskStatusResponse, TaskSubmission, TaskView};
pub use task::{
    new_task_id, CallbackStatus, FailureKind, Task, TaskFailure, TaskFilter, TaskId,
    TaskPriority, TaskStats, TaskStatus,
};
